use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::process::ExitCode;

use relayd::config;
use relayd::Engine;

fn main() -> ExitCode {
    env_logger::init();

    let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config::LISTEN_PORT);
    let plugin_dir = Path::new(config::PLUGIN_DIR);

    let mut engine = match Engine::new(listen_addr, plugin_dir, config::MAX_RELAYS, config::BUFFER_SIZE) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = engine.run() {
        log::error!("engine terminated: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
