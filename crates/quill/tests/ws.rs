use pretty_assertions::assert_eq;
use quill::{
    error::ServeError,
    ws::{Opcode, WsError},
    Conf, Protocol,
};

mod helpers;
use helpers::{connect, run, wire::Client, BoxError};
use tokio::io::DuplexStream;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn handshake(path: &str, version: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         host: example.org\r\n\
         upgrade: websocket\r\n\
         connection: keep-alive, Upgrade\r\n\
         sec-websocket-key: {KEY}\r\n\
         sec-websocket-version: {version}\r\n\r\n"
    )
}

async fn open(client: &mut Client<DuplexStream>) -> Result<(), BoxError> {
    client.send(handshake("/ws", "13")).await?;
    let res = client.read_head().await?;
    assert_eq!(res.status, 101);
    assert_eq!(res.header("upgrade"), Some("websocket"));
    assert_eq!(
        res.header("sec-websocket-accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );

    let welcome = client.read_ws().await?;
    assert_eq!(welcome.opcode, Opcode::Text);
    assert_eq!(&welcome.payload[..], b"welcome");
    Ok(())
}

#[test]
fn echo_then_server_close() {
    run(async {
        let (io, handle) = connect(Conf::default(), Protocol::Detect);
        let mut client = Client::new(io);
        open(&mut client).await?;

        client.send_ws(true, Opcode::Text, b"hi there").await?;
        let frame = client.read_ws().await?;
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"hi there");

        // fragmented, with a ping in the middle
        client.send_ws(false, Opcode::Binary, &[1, 2]).await?;
        client.send_ws(true, Opcode::Ping, b"still?").await?;
        client.send_ws(true, Opcode::Continuation, &[3]).await?;

        let pong = client.read_ws().await?;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"still?");
        let frame = client.read_ws().await?;
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);

        client.send_ws(true, Opcode::Text, b"bye").await?;
        let close = client.read_ws().await?;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&close.payload[2..], b"see you");

        client
            .send_ws(true, Opcode::Close, &1000u16.to_be_bytes())
            .await?;
        assert!(client.read_to_eof().await?.is_empty());
        handle.await??;
        Ok(())
    })
}

#[test]
fn client_close_is_echoed() {
    run(async {
        let (io, handle) = connect(Conf::default(), Protocol::Http1);
        let mut client = Client::new(io);
        open(&mut client).await?;

        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"leaving");
        client.send_ws(true, Opcode::Close, &payload).await?;

        let close = client.read_ws().await?;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..], &1001u16.to_be_bytes());
        assert!(client.read_to_eof().await?.is_empty());
        handle.await??;
        Ok(())
    })
}

#[test]
fn oversized_message_closes_with_1009() {
    run(async {
        let mut conf = Conf::default();
        conf.ws.max_message_size = 16;
        let (io, handle) = connect(conf, Protocol::Http1);
        let mut client = Client::new(io);
        open(&mut client).await?;

        client.send_ws(false, Opcode::Binary, &[0u8; 10]).await?;
        client.send_ws(true, Opcode::Continuation, &[0u8; 10]).await?;

        let close = client.read_ws().await?;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..2], &1009u16.to_be_bytes());
        client.read_to_eof().await?;

        assert!(matches!(
            handle.await?,
            Err(ServeError::Ws(WsError::MessageTooBig { size: 20, max: 16 }))
        ));
        Ok(())
    })
}

#[test]
fn bad_handshakes() {
    run(async {
        let (io, _handle) = connect(Conf::default(), Protocol::Http1);
        let mut client = Client::new(io);

        client.send(handshake("/ws", "8")).await?;
        let res = client.read_response().await?;
        assert_eq!(res.status, 426);
        assert_eq!(res.header("sec-websocket-version"), Some("13"));

        client
            .send(handshake("/ws", "13").replace(KEY, "dG9vIHNob3J0"))
            .await?;
        assert_eq!(client.read_response().await?.status, 400);

        // a valid handshake the handler doesn't want to upgrade
        client.send(handshake("/hello", "13")).await?;
        let res = client.read_response().await?;
        assert_eq!(res.status, 200);
        assert_eq!(res.body_str(), "hello world");
        Ok(())
    })
}
