mod cli;
mod initializers;

use branchforge_controller::Controller;
use branchforge_storage::Store;
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let opts = cli::Options::parse();
    initializers::init_tracing(&opts);
    initializers::init_panic_hook();

    let (config, datadir) = match opts.into_config() {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = match Store::new(&datadir).await {
        Ok(store) => store,
        Err(err) => {
            error!(%err, datadir, "failed to open database");
            std::process::exit(1);
        }
    };

    let controller = match Controller::new(config, store) {
        Ok(controller) => controller,
        Err(err) => {
            error!(%err, "failed to assemble controller");
            std::process::exit(1);
        }
    };

    // Startup reconciliation runs detached: the HTTP surface must be
    // reachable immediately, and recovery may wait on chain and git.
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            let report = controller.run_recovery().await;
            info!(
                checked = report.checked,
                recovered = report.outcomes.len(),
                errors = report.errors.len(),
                "startup recovery finished"
            );
        });
    }

    if let Err(err) = branchforge_controller::serve(controller).await {
        error!(%err, "http server terminated");
        std::process::exit(1);
    }
}
