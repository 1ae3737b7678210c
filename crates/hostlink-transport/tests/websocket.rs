//! Integration tests for the WebSocket transport.
//!
//! A real listener on an OS-assigned port and a real client connection,
//! both driven through the `Connection` trait.

#[cfg(feature = "websocket")]
mod websocket {
    use hostlink_transport::{
        Connection, Transport, WebSocketClientConnection, WebSocketConnection, WebSocketTransport,
    };

    async fn connected_pair() -> (WebSocketConnection, WebSocketClientConnection) {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have an address");

        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let client = WebSocketClientConnection::connect(&format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let server = server.await.expect("accept task should complete");
        (server, client)
    }

    #[tokio::test]
    async fn test_websocket_send_receive_both_directions() {
        let (server, client) = connected_pair().await;
        assert_ne!(server.id(), client.id());

        server.send(b"hello from server").await.expect("send should succeed");
        let received = client.recv().await.expect("recv should succeed");
        assert_eq!(received.as_deref(), Some(&b"hello from server"[..]));

        client.send(b"hello from client").await.expect("send should succeed");
        let received = server.recv().await.expect("recv should succeed");
        assert_eq!(received.as_deref(), Some(&b"hello from client"[..]));
    }

    #[tokio::test]
    async fn test_websocket_send_while_receiver_blocked() {
        let (server, client) = connected_pair().await;
        let server = std::sync::Arc::new(server);

        let reader = {
            let server = server.clone();
            tokio::spawn(async move { server.recv().await })
        };
        tokio::task::yield_now().await;

        // The pending recv must not block a send on the same connection.
        server.send(b"ping").await.expect("send should not be blocked");
        assert_eq!(client.recv().await.unwrap().as_deref(), Some(&b"ping"[..]));

        client.send(b"pong").await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn test_websocket_close_ends_remote_stream() {
        let (server, client) = connected_pair().await;
        client.close().await.expect("close should succeed");
        assert_eq!(server.recv().await.expect("clean close"), None);
    }
}
