use ng_connectivity_models::Connection;
use ng_connectivity_sdk::ConnectivityError;
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

/// Raw TCP connect to the connection's endpoint, bounded by `budget`.
///
/// Only a fail-fast heuristic ahead of the protocol handshake.
pub async fn check_socket(connection: &Connection, budget: Duration) -> Result<(), ConnectivityError> {
    let endpoint = connection.endpoint()?;
    let authority = endpoint.authority();
    let failed = |message: String| ConnectivityError::ConnectionFailed {
        connection_id: connection.id.to_string(),
        message,
        description: Some("Check that the host is reachable and the port is open.".to_string()),
    };
    match timeout(budget, TcpStream::connect(authority.as_str())).await {
        Ok(Ok(_stream)) => {
            debug!(connection_id = %connection.id, endpoint = %authority, "Socket check succeeded");
            Ok(())
        }
        Ok(Err(e)) => Err(failed(format!("{authority} is not reachable: {e}"))),
        Err(_) => Err(failed(format!(
            "{authority} did not accept a connection within {}ms",
            budget.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_models::{ConnectionId, ConnectionType};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_listener_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, format!("tcp://127.0.0.1:{port}"));
        check_socket(&connection, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_fails_with_connection_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, format!("tcp://127.0.0.1:{port}"));
        let err = check_socket(&connection, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::ConnectionFailed { .. }));
    }
}
