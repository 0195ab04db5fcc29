use driftcove_server::{config::Settings, db, reconcile, serve, Context};
use parking_lot::{Mutex, RwLock};
use std::{env, process, sync::Arc};

#[tokio::main]
async fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    if unsafe { libc::getuid() } != 0 {
        eprintln!("driftcove-server must run as root to manage WireGuard and nftables.");
        process::exit(1);
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            log::error!("configuration error: {err:#}");
            process::exit(1);
        },
    };

    let conn = match db::open(&settings) {
        Ok(conn) => conn,
        Err(err) => {
            log::error!("failed to open catalog at {}: {err}", settings.db_path.display());
            process::exit(1);
        },
    };

    if let Err(err) = reconcile::apply_config_from_database(&conn, &settings) {
        log::error!("boot reconciliation failed: {err}");
        process::exit(1);
    }

    let context = Context {
        db: Arc::new(Mutex::new(conn)),
        lock: Arc::new(RwLock::new(())),
        settings: Arc::new(settings),
    };

    log::info!(
        "driftcove-server {} listening on port {}",
        driftcove_server::VERSION,
        context.settings.listen_port
    );

    if let Err(err) = serve(context).await {
        log::error!("server error: {err}");
        process::exit(1);
    }
}
