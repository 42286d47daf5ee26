use tracing_subscriber::{fmt, EnvFilter};

use crate::Result;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the engine crates and `service_name`
/// log at info and dependencies at warn. A second call is a no-op.
pub fn init(service_name: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let service = service_name.replace('-', "_");
            EnvFilter::new(format!("warn,bcast=info,bcast_core=info,{service}=info"))
        }
    };

    // Already installed (tests, embedding binaries): keep the existing one.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();

    Ok(())
}
