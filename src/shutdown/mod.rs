//! SIGINT/SIGTERM handling for the consumer process.
//!
//! The first signal only raises a flag; the consumer finishes its current
//! iteration and stops. A second signal while that flag is set terminates the
//! process with [`FORCED_EXIT_CODE`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use signal_hook::SigId;
#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;

pub const FORCED_EXIT_CODE: i32 = 130;

#[cfg(unix)]
const TERMINATION_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

pub struct ShutdownHooks {
    requested: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let requested = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let mut sig_ids = Vec::with_capacity(TERMINATION_SIGNALS.len() * 2);
            for signal in TERMINATION_SIGNALS {
                // Registered first so it sees the flag before this signal sets it.
                sig_ids.push(flag::register_conditional_shutdown(
                    signal,
                    FORCED_EXIT_CODE,
                    Arc::clone(&requested),
                )?);
                sig_ids.push(flag::register(signal, Arc::clone(&requested))?);
            }
            return Ok(Self { requested, sig_ids });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { requested })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
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
    use signal_hook::consts::signal::SIGTERM;
    use signal_hook::low_level::raise;

    use super::ShutdownHooks;

    #[test]
    fn first_signal_requests_graceful_stop() {
        let hooks = ShutdownHooks::install().expect("hooks should install");
        assert!(!hooks.is_triggered());

        raise(SIGTERM).expect("raising SIGTERM should succeed");

        assert!(hooks.is_triggered());
    }
}
