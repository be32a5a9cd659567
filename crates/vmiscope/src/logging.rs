//! Logger installation for hosts that do not bring their own.
//!
//! The library only emits through the `log` facade. Binaries call
//! `env_logger::init()` themselves; foreign hosts go through [`init`]
//! (exported as `vmi_logger_init`), which is safe to call repeatedly and
//! leaves an already installed logger alone.

use log::debug;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install an `env_logger` honouring `RUST_LOG`. Returns `true` if this
/// call installed it.
pub fn init() -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        installed = env_logger::Builder::from_default_env()
            .format_timestamp_millis()
            .try_init()
            .is_ok();
    });
    if installed {
        debug!("vmiscope logger installed");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        assert!(!init());
        assert!(!init());
    }
}
