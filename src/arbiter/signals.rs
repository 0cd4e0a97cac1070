//! Lifecycle signals.
//!
//! SIGINT/SIGTERM request a graceful shutdown; a second one while stopping,
//! or SIGQUIT at any time, kills everything without draining.

use std::rc::Weak;
use tokio::signal::unix::{signal, SignalKind};

use super::core::ArbiterCore;
use crate::event_loop::EventLoop;
use crate::types::Result;

pub(crate) fn install(event_loop: &EventLoop, core: Weak<ArbiterCore>) -> Result<()> {
    let (mut interrupt, mut terminate, mut quit) = {
        let _guard = event_loop.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::quit())?,
        )
    };
    let sender = event_loop.event_sender();
    event_loop.spawn_local(async move {
        loop {
            let (name, abrupt) = tokio::select! {
                _ = interrupt.recv() => ("SIGINT", false),
                _ = terminate.recv() => ("SIGTERM", false),
                _ = quit.recv() => ("SIGQUIT", true),
            };
            let core = core.clone();
            let posted = sender.post(move || {
                if let Some(core) = core.upgrade() {
                    core.on_signal(name, abrupt);
                }
            });
            if !posted {
                break;
            }
        }
    });
    Ok(())
}
