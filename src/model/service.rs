//! Node services
//!
//! Each node owns independently startable/stoppable services. The engine
//! only sequences `start`/`stop`/`is_running`; service internals are an
//! external boundary. [`ProcessService`] is the shipped implementation,
//! running a command inside the node's namespace.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait NodeService: Send + Sync {
    fn name(&self) -> &str;

    /// Services are deployed in descending priority order.
    fn priority(&self) -> i32 {
        0
    }

    fn autostart(&self) -> bool {
        false
    }

    fn autostart_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn start(&self) -> bool;

    /// Stop the service, waiting up to `wait`. With `auto_kill`, escalate to
    /// a hard kill when the wait elapses. Returns whether the service is
    /// down afterwards.
    fn stop(&self, wait: Duration, auto_kill: bool) -> bool;

    fn is_running(&self) -> bool;
}

/// A service backed by a process spawned inside a network namespace.
pub struct ProcessService {
    name: String,
    namespace_name: String,
    command: Vec<String>,
    priority: i32,
    autostart: bool,
    autostart_delay: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessService {
    pub fn new(
        name: impl Into<String>,
        namespace_name: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace_name: namespace_name.into(),
            command,
            priority: 0,
            autostart: false,
            autostart_delay: Duration::ZERO,
            child: Mutex::new(None),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_autostart(mut self, delay: Duration) -> Self {
        self.autostart = true;
        self.autostart_delay = delay;
        self
    }
}

impl NodeService for ProcessService {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn autostart(&self) -> bool {
        self.autostart
    }

    fn autostart_delay(&self) -> Duration {
        self.autostart_delay
    }

    fn start(&self) -> bool {
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                debug!(service = %self.name, "already running");
                return true;
            }
        }
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &self.namespace_name])
            .args(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match cmd.spawn() {
            Ok(child) => {
                debug!(service = %self.name, pid = child.id(), "started");
                *guard = Some(child);
                true
            }
            Err(e) => {
                warn!(service = %self.name, "could not start: {e}");
                false
            }
        }
    }

    fn stop(&self, wait: Duration, auto_kill: bool) -> bool {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return true;
        };
        if child.try_wait().ok().flatten().is_some() {
            *guard = None;
            return true;
        }
        let pid = Pid::from_raw(child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if child.try_wait().ok().flatten().is_some() {
                *guard = None;
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if auto_kill {
            warn!(service = %self.name, "did not stop in time, killing");
            let _ = child.kill();
            let _ = child.wait();
            *guard = None;
            return true;
        }
        false
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-memory service for exercising the engine's sequencing.
    pub(crate) struct FakeService {
        name: String,
        priority: i32,
        autostart: bool,
        running: Arc<AtomicBool>,
        refuse_stop: bool,
    }

    impl FakeService {
        pub(crate) fn new(name: &str, priority: i32) -> Self {
            Self {
                name: name.to_string(),
                priority,
                autostart: true,
                running: Arc::new(AtomicBool::new(false)),
                refuse_stop: false,
            }
        }

        pub(crate) fn stubborn(name: &str) -> Self {
            Self {
                refuse_stop: true,
                ..Self::new(name, 0)
            }
        }
    }

    impl NodeService for FakeService {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn autostart(&self) -> bool {
            self.autostart
        }
        fn start(&self) -> bool {
            self.running.store(true, Ordering::SeqCst);
            true
        }
        fn stop(&self, _wait: Duration, _auto_kill: bool) -> bool {
            if self.refuse_stop {
                return false;
            }
            self.running.store(false, Ordering::SeqCst);
            true
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn fake_service_lifecycle() {
        let service = FakeService::new("probe", 10);
        assert!(!service.is_running());
        assert!(service.start());
        assert!(service.is_running());
        assert!(service.stop(Duration::ZERO, false));
        assert!(!service.is_running());
    }

    #[test]
    fn stubborn_service_reports_failure() {
        let service = FakeService::stubborn("zombie");
        service.start();
        assert!(!service.stop(Duration::ZERO, false));
        assert!(service.is_running());
    }
}
