//! Bridge host binary. Spawned by the native side, one process per plugin
//! instance.

use std::env;

use pontoon_bridge::protocol::BridgeConfig;
use pontoon_bridge::Result;
use pontoon_host::HostServer;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let socket_path = env::args()
        .nth(1)
        .expect("Socket path required as first argument");

    let config = BridgeConfig {
        socket_path: socket_path.into(),
        ..Default::default()
    };

    // Embedders link `pontoon_host` as a library and supply a factory that
    // wraps their plugin loader; the standalone binary serves passthrough
    // objects for smoke testing the bridge itself.
    let server = HostServer::with_passthrough(config);
    server.run(|| {})
}
