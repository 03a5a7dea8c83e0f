//! Mock-server startup that degrades to a skip in sandboxes without sockets.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "MANUSCRIPT_REQUIRE_SOCKET_TESTS";

/// CI sets this so a sandbox regression fails loudly instead of skipping.
fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a wiremock server, or returns `None` when localhost cannot be bound.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let bindable = TcpListener::bind("127.0.0.1:0").is_ok();
    async move {
        if bindable {
            return Some(MockServer::start().await);
        }
        let message = format!(
            "[socket-bound-test] {}:{} cannot bind a localhost socket",
            caller.file(),
            caller.line()
        );
        assert!(!sockets_required(), "{message}; unset {REQUIRE_ENV} to allow skipping");
        eprintln!("{message}; skipping (set {REQUIRE_ENV}=1 to fail instead)");
        None
    }
}
