//! Scenario 6 (§8): a filter handler that cancels stops the attempt before any connection is
//! added -- no `ConfigureConnection` event, and the server's connection count is unchanged.

use meshnet::events::FilterOutcome;
use meshnet::{ClientManager, Event, ManagerConfig, NetworkId, ServerManager, ServerType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn cancelled_filter_keeps_connection_out_of_the_registry() {
    let config = ManagerConfig {
        server_type: ServerType::Tcp,
        ..ManagerConfig::default()
    };
    let server = Arc::new(ServerManager::new(NetworkId::bind("filter-cancel-server", 0), config).expect("valid server config"));

    let configure_events = Arc::new(AtomicUsize::new(0));
    let c = configure_events.clone();
    server.add_event_handler(0, move |event| {
        if let Event::ConfigureConnection { .. } = event {
            c.fetch_add(1, Ordering::SeqCst);
        }
    });

    server.add_filter_handler(0, Box::new(|_addr, name| FilterOutcome {
        cancel: true,
        name: name.to_string(),
    }));

    assert!(server.start());
    let bound = server.stream_local_addr().expect("stream listener bound");
    let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), bound.port());

    let client_config = ManagerConfig {
        server_type: ServerType::Tcp,
        ..ManagerConfig::default()
    };
    let client = ClientManager::new(NetworkId::bind("filter-cancel-client", 0), NetworkId::connect("server", addr), client_config)
        .expect("valid client config");

    assert!(client.open());
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(configure_events.load(Ordering::SeqCst), 0);
    assert_eq!(server.connection_count(), 0);

    server.stop();
}
