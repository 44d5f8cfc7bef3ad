use anyhow::{anyhow, Context, Result};
use std::process::Command;
use tracing::{info, warn};

/// Start and stop the daemon that owns the BlueZ store.
pub trait ServiceControl: Send + Sync {
    fn stop(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Systemd {
    pub unit: String,
}

impl Systemd {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    fn systemctl(&self, verb: &str) -> Result<()> {
        let output = Command::new("systemctl")
            .args([verb, self.unit.as_str()])
            .output()
            .with_context(|| format!("run systemctl {} {}", verb, self.unit))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "systemctl {} {} failed: {}",
                verb,
                self.unit,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

impl ServiceControl for Systemd {
    fn stop(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn start(&self) -> Result<()> {
        self.systemctl("start")
    }
}

/// For hosts where the daemon is managed elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmanaged;

impl ServiceControl for Unmanaged {
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps the service stopped while alive and starts it again on drop.
pub struct ServiceGuard<'a> {
    service: &'a dyn ServiceControl,
    stopped: bool,
}

impl<'a> ServiceGuard<'a> {
    pub fn stop(service: &'a dyn ServiceControl) -> Result<Self> {
        service.stop()?;
        info!("service: stopped");
        Ok(Self {
            service,
            stopped: true,
        })
    }

    /// Restart now and report the result instead of only logging it.
    pub fn finish(mut self) -> Result<()> {
        self.stopped = false;
        self.service.start()?;
        info!("service: started");
        Ok(())
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        if !self.stopped {
            return;
        }
        self.stopped = false;
        match self.service.start() {
            Ok(()) => info!("service: started"),
            Err(err) => warn!("service: restart failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_start: bool,
    }

    impl ServiceControl for Recorder {
        fn stop(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }

        fn start(&self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                return Err(anyhow!("unit not found"));
            }
            Ok(())
        }
    }

    #[test]
    fn drop_restarts_service() {
        let service = Recorder::default();
        {
            let _guard = ServiceGuard::stop(&service).unwrap();
        }
        assert_eq!(*service.calls.lock().unwrap(), vec!["stop", "start"]);
    }

    #[test]
    fn finish_restarts_exactly_once() {
        let service = Recorder {
            fail_start: true,
            ..Recorder::default()
        };
        let guard = ServiceGuard::stop(&service).unwrap();
        assert!(guard.finish().is_err());
        assert_eq!(*service.calls.lock().unwrap(), vec!["stop", "start"]);
    }
}
