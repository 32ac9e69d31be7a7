use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Routes SIGINT/SIGTERM into an existing stop flag, so a signal and the
/// CLOSE action end discovery and serving through the same path.
pub struct ShutdownHooks {
    flag: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install_into(stop_flag: Arc<AtomicBool>) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&stop_flag))?;
            let id_term = match flag::register(SIGTERM, Arc::clone(&stop_flag)) {
                Ok(id) => id,
                Err(error) => {
                    unregister(id_int);
                    return Err(error);
                }
            };
            Ok(Self {
                flag: stop_flag,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { flag: stop_flag })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use signal_hook::consts::signal::SIGTERM;
    use signal_hook::low_level::raise;

    use super::ShutdownHooks;

    #[test]
    fn sigterm_sets_shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let hooks = ShutdownHooks::install_into(Arc::clone(&flag)).expect("hooks should install");
        assert!(!hooks.is_triggered());

        raise(SIGTERM).expect("signal should be raised");

        assert!(flag.load(Ordering::SeqCst));
        assert!(hooks.is_triggered());
    }
}
