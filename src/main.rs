//! Pulsar demo arbiter - main entry point.
//!
//! Runs an `echo` pool under a single arbiter. Worker processes spawned in
//! process mode re-enter this same `main` and serve one pool member.
//!
//! `--self-test` drives the pool from a control thread (calls, a forced kill
//! and its replacement) and stops the arbiter when done. In process mode it
//! also SIGKILLs one worker from outside and waits for its replacement.

use clap::{Parser, ValueEnum};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pulsar_core::{
    ActorId, Arbiter, ArbiterHandle, Concurrency, Config, Error, HandlerTable, MonitorSpec,
    Outcome, Payload, Result, Target,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Thread,
    Process,
}

#[derive(Debug, Parser)]
#[command(name = "pulsar-arbiter", about = "Run a supervised echo pool")]
struct Cli {
    /// How pool members are hosted.
    #[arg(long, value_enum, default_value = "thread")]
    concurrency: Mode,

    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// JSON configuration file.
    #[arg(long, env = "PULSAR_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many milliseconds.
    #[arg(long)]
    run_for_ms: Option<u64>,

    /// Exercise the pool, then stop.
    #[arg(long)]
    self_test: bool,
}

fn echo_table() -> HandlerTable {
    HandlerTable::new().command("upper", |_ctx, request| {
        match request.args.as_str() {
            Some(text) => Outcome::Value(json!(text.to_uppercase())),
            None => Outcome::Error(pulsar_core::Failure::handler("upper expects a string")),
        }
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("arbiter_failed: error={}", e);
            eprintln!("pulsar-arbiter: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    pulsar_core::observability::init_tracing_with(&config.observability);

    let concurrency = match cli.concurrency {
        Mode::Thread => Concurrency::Thread,
        Mode::Process => Concurrency::Process,
    };
    let mut arbiter = Arbiter::new(config)?;
    arbiter.add_monitor(
        MonitorSpec::new("echo", echo_table)
            .pool_size(cli.pool_size)
            .concurrency(concurrency),
    )?;

    if !pulsar_core::actor::is_worker_process() {
        let handle = arbiter.handle();
        if cli.self_test {
            let pool_size = cli.pool_size;
            std::thread::spawn(move || {
                if let Err(e) = self_test(&handle, pool_size, concurrency) {
                    eprintln!("self_test: failed: {}", e);
                    let _ = handle.kill();
                    return;
                }
                println!("self_test: ok");
                let _ = handle.stop();
            });
        } else if let Some(ms) = cli.run_for_ms {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                let _ = handle.stop();
            });
        }
    }

    let status = arbiter.run()?;
    tracing::info!("pulsar_arbiter_exit: status={:?}", status);
    Ok(ExitCode::from(status.code() as u8))
}

fn self_test(handle: &ArbiterHandle, pool_size: usize, concurrency: Concurrency) -> Result<()> {
    handle.wait_running()?;

    let echoed = handle.call("echo", "echo", json!({ "n": 1 }))?;
    check(echoed == json!({ "n": 1 }), "builtin echo through the pool")?;
    let upper = handle.call("echo", "upper", json!("pulsar"))?;
    check(upper == json!("PULSAR"), "upper handler")?;
    check(
        handle.call(Target::Arbiter, "ping", Payload::Null)? == json!("pong"),
        "arbiter ping",
    )?;

    let victim = first_member(handle)?;
    let killed = handle.call(
        Target::Arbiter,
        "kill_actor",
        json!({ "aid": victim.as_str() }),
    )?;
    check(killed == json!(true), "kill_actor accepted")?;
    wait_replaced(handle, &victim, pool_size)?;

    let upper = handle.call("echo", "upper", json!("again"))?;
    check(upper == json!("AGAIN"), "pool serves after replacement")?;

    if concurrency == Concurrency::Process {
        let victim = first_member(handle)?;
        let info = handle.call(Target::Aid(victim.clone()), "info", Payload::Null)?;
        let pid = info["pid"]
            .as_u64()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| Error::internal("member info carries no pid"))?;
        check(
            pid != std::process::id() as i32,
            "member runs in its own process",
        )?;
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| Error::internal(format!("kill {}: {}", pid, e)))?;
        wait_replaced(handle, &victim, pool_size)?;
        let upper = handle.call("echo", "upper", json!("revived"))?;
        check(upper == json!("REVIVED"), "pool serves after an external kill")?;
        println!("self_test: external_kill_replaced pid={}", pid);
    }
    Ok(())
}

fn first_member(handle: &ArbiterHandle) -> Result<ActorId> {
    handle
        .snapshot()?
        .component("echo")
        .and_then(|c| c.members.first())
        .map(|m| m.identity.aid.clone())
        .ok_or_else(|| Error::not_found("echo pool has no members"))
}

/// Wait until `victim` is gone and the pool is back to full strength.
fn wait_replaced(handle: &ArbiterHandle, victim: &ActorId, pool_size: usize) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.snapshot()?;
        let replaced = snapshot
            .component("echo")
            .is_some_and(|c| c.members.iter().all(|m| m.identity.aid != *victim));
        if replaced && snapshot.running("echo") == pool_size {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(Error::timeout(format!("member {} was not replaced", victim)));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn check(ok: bool, what: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::internal(format!("self test check failed: {}", what)))
    }
}
