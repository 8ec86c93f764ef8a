// Shared by several test binaries; not every helper is used by each.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tn3270_bridge::config::{BridgeConfig, BridgeConfigBuilder, Timeouts};
use tn3270_bridge::emulator::{EmulatorLauncher, ScriptIo};
use tn3270_bridge::executor::ActionExecutor;
use tn3270_bridge::session::SessionManager;
use tn3270_bridge::BridgeResult;
use tn3270_bridge_fixtures::{FakeHost, HostBehavior};

pub type SharedHost = Arc<Mutex<FakeHost>>;

/// In-process transport: every request line is answered by the shared fake host.
pub struct FakeIo {
    host: SharedHost,
    pending: VecDeque<String>,
}

impl ScriptIo for FakeIo {
    fn send_line(&mut self, line: &str) -> BridgeResult<()> {
        let reply = self.host.lock().unwrap().handle(line);
        self.pending.extend(reply);
        Ok(())
    }

    fn recv_line(&mut self, _deadline: Instant) -> BridgeResult<Option<String>> {
        Ok(self.pending.pop_front())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn shutdown(&mut self, _grace: Duration) -> BridgeResult<()> {
        Ok(())
    }
}

pub struct FakeLauncher {
    host: SharedHost,
    launches: AtomicU32,
}

impl FakeLauncher {
    pub fn new(host: SharedHost) -> Self {
        Self {
            host,
            launches: AtomicU32::new(0),
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl EmulatorLauncher for FakeLauncher {
    fn launch(&self) -> BridgeResult<Box<dyn ScriptIo>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeIo {
            host: Arc::clone(&self.host),
            pending: VecDeque::new(),
        }))
    }
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> BridgeConfigBuilder {
    BridgeConfigBuilder::new()
        .retry(3, 10)
        .timeouts(Timeouts {
            connect_ms: 1_000,
            action_ms: 1_000,
            capture_ms: 1_000,
            disconnect_grace_ms: 50,
        })
}

pub struct Harness {
    pub host: SharedHost,
    pub launcher: Arc<FakeLauncher>,
    pub executor: Arc<ActionExecutor>,
}

impl Harness {
    pub fn new(behavior: HostBehavior) -> Self {
        Self::with_config(behavior, fast_config().build().unwrap())
    }

    pub fn with_config(behavior: HostBehavior, config: BridgeConfig) -> Self {
        let host = Arc::new(Mutex::new(FakeHost::new(behavior)));
        let launcher = Arc::new(FakeLauncher::new(Arc::clone(&host)));
        let manager = SessionManager::with_launcher(config, launcher.clone());
        Self {
            host,
            launcher,
            executor: Arc::new(ActionExecutor::new(Arc::new(manager))),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        self.executor.manager()
    }

    pub fn host(&self) -> std::sync::MutexGuard<'_, FakeHost> {
        self.host.lock().unwrap()
    }
}
