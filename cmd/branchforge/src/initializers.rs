use tracing_subscriber::{EnvFilter, filter::Directive};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Last-resort crash-proofing: a panicking task (supervisor IPC above all)
/// must not take the controller down. Spawned tasks already contain their
/// panics; this hook makes sure every one of them lands in the log stream
/// instead of vanishing.
pub fn init_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "panic caught; controller continues");
    }));
}
