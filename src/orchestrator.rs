//! The engine thread: owns the consuming end of the [`crate::command_queue`]
//! and drives both the autonomous polling loop and every command a caller
//! enqueues against it. Blocks on a `chan_select!` between its command
//! channel and a periodic timer tick, and holds a local deferral queue
//! for `Pause`/`Resume` so commands that arrive mid-pause are replayed
//! instead of dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chan::{chan_select, Receiver};
use log::{info, warn};

use crate::command_queue::{self, CancelFlag, Command, CommandKind, Completion};
use crate::config::OrchestratorMode;
use crate::engine::Engine;

/// Shared pause/resume signal between the public API and the engine
/// thread, so `pause()` can block its caller until the thread has
/// actually stopped mid-cycle rather than just flipping a flag it never
/// observes.
#[derive(Default)]
pub struct PauseFlag {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseFlag {
    pub fn new() -> Arc<PauseFlag> {
        Arc::new(PauseFlag::default())
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.condvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    /// Blocks the calling (engine) thread while paused, waking promptly
    /// once `resume()` is called.
    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.condvar.wait(paused).unwrap();
        }
    }
}

/// Drains the command queue and runs the configured Uptane cycle on its
/// own polling cadence. A single `Engine`, shared with the public facade
/// through an `Arc<Mutex<_>>`, is locked only for the duration of one
/// command.
pub struct Orchestrator {
    engine: Arc<Mutex<Engine>>,
    rx: Receiver<Command>,
    pause: Arc<PauseFlag>,
    mode: OrchestratorMode,
    polling: Duration,
    /// Commands received while paused, replayed in arrival order once
    /// `resume()` lifts the pause. Kept local rather than as a second
    /// channel so the command queue's public surface stays untouched.
    deferred: VecDeque<Command>,
    /// The in-flight command's cancellation token, shared with whoever
    /// holds the matching `Device` facade so `abort()` can flag it the
    /// instant it's called instead of waiting behind it in the FIFO.
    current: Arc<Mutex<Option<CancelFlag>>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<Mutex<Engine>>,
        rx: Receiver<Command>,
        pause: Arc<PauseFlag>,
        mode: OrchestratorMode,
        polling: Duration,
        current: Arc<Mutex<Option<CancelFlag>>>,
    ) -> Orchestrator {
        Orchestrator { engine, rx, pause, mode, polling, deferred: VecDeque::new(), current }
    }

    /// Runs until a `Shutdown` command is received. Intended to be the
    /// body of the dedicated engine thread spawned by `Uptane::run_forever`.
    pub fn run(&mut self) {
        let tick = chan::tick(self.polling);
        loop {
            if self.pause.is_paused() {
                self.pause.wait_while_paused();
            }

            if let Some(command) = self.deferred.pop_front() {
                if !self.dispatch(command) {
                    return;
                }
                continue;
            }

            let mut received = None;
            chan_select! {
                self.rx.recv() -> command => received = command,
                tick.recv() => {
                    self.auto_cycle();
                    continue;
                },
            }
            match received {
                Some(command) => {
                    if !self.dispatch(command) {
                        return;
                    }
                }
                None => return, // producer side dropped: treat like shutdown
            }
        }
    }

    /// Runs one command to completion, replying on its channel. Returns
    /// `false` once `Shutdown` has been processed, telling `run` to stop.
    fn dispatch(&mut self, command: Command) -> bool {
        if matches!(command.kind, CommandKind::Pause | CommandKind::Resume) {
            return self.handle_control(command);
        }
        if self.pause.is_paused() {
            info!("deferring {:?} while paused", command.kind);
            self.deferred.push_back(command);
            return true;
        }

        let cancel = command.cancel.clone();
        *self.current.lock().unwrap() = Some(cancel.clone());
        let mut engine = match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result: Result<(), crate::error::Error> = (|| {
            match &command.kind {
                CommandKind::Initialize => engine.initialize(),
                CommandKind::CheckUpdates => engine.check_updates(&cancel).map(|_| ()),
                CommandKind::Download(targets) => engine.download(targets, &cancel).map(|_| ()),
                CommandKind::Install(targets) => engine.install(targets, &cancel).map(|_| ()),
                CommandKind::SendManifest(raw_report) => engine.send_manifest(raw_report.clone()).map(|_| ()),
                CommandKind::SendDeviceData(hwinfo) => engine.send_device_data(hwinfo.clone()),
                CommandKind::Pause | CommandKind::Resume => unreachable!("handled above"),
                CommandKind::Abort => {
                    cancel.cancel();
                    command_queue::drain_as_cancelled(&self.rx);
                    for queued in self.deferred.drain(..) {
                        queued.cancel.cancel();
                        queued.complete(Completion::Cancelled);
                    }
                    Ok(())
                }
                CommandKind::Shutdown => Ok(()),
            }
        })();
        drop(engine);
        *self.current.lock().unwrap() = None;

        let shutdown = matches!(command.kind, CommandKind::Shutdown);
        match result {
            Ok(()) => command.complete(Completion::Success),
            Err(err) => {
                warn!("command {:?} failed: {}", command.id, err);
                command.complete(err.into());
            }
        }
        !shutdown
    }

    fn handle_control(&mut self, command: Command) -> bool {
        match command.kind {
            CommandKind::Pause => {
                self.pause.pause();
                command.complete(Completion::Success);
            }
            CommandKind::Resume => {
                self.pause.resume();
                command.complete(Completion::Success);
            }
            _ => unreachable!("handle_control only called for Pause/Resume"),
        }
        true
    }

    /// One polling-interval tick of the autonomous loop: runs whichever
    /// portion of the Uptane cycle the configured `OrchestratorMode` names.
    fn auto_cycle(&mut self) {
        let mut engine = match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outcome = match self.mode {
            OrchestratorMode::Full | OrchestratorMode::Once => engine.uptane_cycle().map(|_| ()),
            OrchestratorMode::Check => engine.check_updates(&crate::command_queue::CancelFlag::new()).map(|_| ()),
            OrchestratorMode::Download => {
                let cancel = crate::command_queue::CancelFlag::new();
                engine.check_updates(&cancel).and_then(|checked| engine.download(&checked.updates, &cancel)).map(|_| ())
            }
            OrchestratorMode::Install => {
                let cancel = crate::command_queue::CancelFlag::new();
                engine
                    .check_updates(&cancel)
                    .and_then(|checked| engine.download(&checked.updates, &cancel))
                    .and_then(|downloaded| engine.install(&downloaded.downloaded, &cancel))
                    .map(|_| ())
            }
            OrchestratorMode::Manual => return,
            OrchestratorMode::CampaignCheck | OrchestratorMode::CampaignAccept | OrchestratorMode::CampaignReject => {
                warn!("campaign orchestration is not implemented; skipping this tick");
                return;
            }
        };
        if let Err(err) = outcome {
            warn!("autonomous cycle failed: {}", err);
            engine.emit_error(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::command_queue::channel;
    use crate::events::NullSink;
    use crate::fetcher::RepositoryEndpoint;
    use crate::http::TestClient;
    use crate::metadata::{EcuSerial, HardwareId, RepositoryKind};
    use crate::pacman::NoPackageManager;
    use crate::storage::{FilesystemStorage, Storage};
    use std::sync::Arc;
    use url::Url;

    fn test_engine() -> (tempfile::TempDir, Arc<Mutex<Engine>>) {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(dir.path().join("storage")));
        let client: Arc<dyn crate::http::Client> = Arc::new(TestClient::from(vec![]));
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        let engine = Engine::new(
            storage,
            client.clone(),
            client,
            clock,
            RepositoryEndpoint { kind: RepositoryKind::Director, base_url: Url::parse("https://director.example/").unwrap() },
            RepositoryEndpoint { kind: RepositoryKind::Image, base_url: Url::parse("https://image.example/").unwrap() },
            Box::new(NoPackageManager),
            Box::new(NullSink),
            dir.path().join("staging"),
            EcuSerial("p1".into()),
            HardwareId("hw-p1".into()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        (dir, Arc::new(Mutex::new(engine)))
    }

    #[test]
    fn pause_defers_commands_until_resume() {
        let (_dir, engine) = test_engine();
        let (handle, rx) = channel();
        let pause = PauseFlag::new();
        let mut orchestrator = Orchestrator::new(engine, rx, pause.clone(), OrchestratorMode::Manual, Duration::from_secs(3600), Arc::new(Mutex::new(None)));

        pause.pause();
        let (_cancel, reply_rx) = handle.enqueue(CommandKind::Initialize);
        let command = orchestrator.rx.recv().unwrap();
        assert!(orchestrator.dispatch(command));
        assert_eq!(orchestrator.deferred.len(), 1);
        assert!(reply_rx.try_recv().is_err());

        pause.resume();
        let deferred = orchestrator.deferred.pop_front().unwrap();
        assert!(orchestrator.dispatch(deferred));
        assert!(matches!(reply_rx.recv().unwrap(), Completion::Success));
    }

    #[test]
    fn shutdown_command_stops_dispatch_loop() {
        let (_dir, engine) = test_engine();
        let (handle, rx) = channel();
        let pause = PauseFlag::new();
        let mut orchestrator = Orchestrator::new(engine, rx, pause, OrchestratorMode::Manual, Duration::from_secs(3600), Arc::new(Mutex::new(None)));

        handle.shutdown();
        let command = orchestrator.rx.recv().unwrap();
        assert!(!orchestrator.dispatch(command));
    }

    #[test]
    fn abort_cancels_the_current_command_and_drains_the_queue() {
        let (_dir, engine) = test_engine();
        let (handle, rx) = channel();
        let pause = PauseFlag::new();
        let current = Arc::new(Mutex::new(None));
        let mut orchestrator = Orchestrator::new(engine, rx, pause, OrchestratorMode::Manual, Duration::from_secs(3600), current.clone());

        let (check_cancel, _check_reply) = handle.enqueue(CommandKind::CheckUpdates);
        let (_download_cancel, download_reply) = handle.enqueue(CommandKind::Download(vec![]));

        // Simulate the engine thread picking up the first command: `current`
        // is populated, then the caller's `abort()` fires before dispatch
        // would otherwise reach the queued Download.
        let check_command = orchestrator.rx.recv().unwrap();
        *current.lock().unwrap() = Some(check_command.cancel.clone());
        assert!(!check_cancel.is_cancelled());

        handle.enqueue(CommandKind::Abort);
        if let Some(in_flight) = current.lock().unwrap().as_ref() {
            in_flight.cancel();
        }
        assert!(check_cancel.is_cancelled());
        check_command.complete(Completion::Cancelled);

        let abort_command = orchestrator.rx.recv().unwrap();
        assert!(orchestrator.dispatch(abort_command));
        assert!(matches!(download_reply.recv().unwrap(), Completion::Cancelled));
    }

    #[test]
    fn pause_then_resume_unblocks_a_waiting_thread() {
        let pause = PauseFlag::new();
        pause.pause();
        let waiter = pause.clone();
        let handle = std::thread::spawn(move || waiter.wait_while_paused());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        pause.resume();
        handle.join().unwrap();
    }
}
