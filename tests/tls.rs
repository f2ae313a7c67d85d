use interpose::{
  encode_basic_auth, CertificateAuthority, ConnectionParam, HttpSender, Message, ProxyChain,
  ProxyCredentials, Socket, TlsProvider,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut data = Vec::new();
  let mut buf = [0u8; 512];
  while !data.windows(4).any(|w| w == b"\r\n\r\n") {
    let n = AsyncReadExt::read(stream, &mut buf).await.unwrap();
    if n == 0 {
      break;
    }
    data.extend_from_slice(&buf[..n]);
  }
  String::from_utf8_lossy(&data).to_string()
}

/// An upstream proxy that answers `CONNECT` and then terminates TLS for the
/// tunnelled origin. With `authorization`, tunnels without that
/// `Proxy-Authorization` value get a `407` and the connection is closed.
async fn tunnel_proxy(authorization: Option<String>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
  let provider = Arc::new(TlsProvider::with_generated_ca().unwrap());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      let connect = read_head(&mut stream).await;
      log.lock().unwrap().push(connect.clone());
      let allowed = match &authorization {
        Some(auth) => connect.contains(&format!("Proxy-Authorization: {}\r\n", auth)),
        None => true,
      };
      if !allowed {
        let _ = stream
          .write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"lab\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
          )
          .await;
        continue;
      }
      stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .unwrap();
      let mut socket = provider
        .create_tunnel_server_socket(stream, Some("fallback.test"))
        .await
        .unwrap();
      let request = read_head(&mut socket).await;
      log.lock().unwrap().push(request);
      socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret")
        .await
        .unwrap();
      socket.shutdown().await.ok();
    }
  });
  (addr, seen)
}

fn chained_sender(chain: ProxyChain) -> HttpSender {
  HttpSender::builder()
    .param(
      ConnectionParam::default()
        .timeout(Some(Duration::from_secs(5)))
        .max_retries(0)
        .proxy_chain(Some(chain)),
    )
    .build()
    .unwrap()
}

#[tokio::test]
async fn tunnel_socket_presents_leaf_for_sni() {
  let proxy = Arc::new(TlsProvider::with_generated_ca().unwrap());
  let root = proxy.certificate_authority().ca_cert_der().clone();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  let server_side = proxy.clone();
  let server = tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut socket = server_side
      .create_tunnel_server_socket(stream, Some("fallback.test"))
      .await
      .unwrap();
    let sni = socket.server_name();
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    socket.write_all(b"pong").await.unwrap();
    socket.flush().await.unwrap();
    (sni, buf)
  });

  let client = TlsProvider::with_generated_ca().unwrap();
  let tcp = Socket::plain(TcpStream::connect(addr).await.unwrap());
  let mut socket = client.create_client_socket(tcp, "target.test").await.unwrap();
  assert!(socket.is_tls());
  socket.write_all(b"ping").await.unwrap();
  socket.flush().await.unwrap();
  let mut reply = [0u8; 4];
  socket.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply, b"pong");

  let (sni, request) = server.await.unwrap();
  assert_eq!(sni.as_deref(), Some("target.test"));
  assert_eq!(&request, b"ping");
  // the origin certificate was issued for the SNI name by the proxy root
  let leaf = socket.peer_certificate().unwrap();
  let cached = proxy
    .certificate_authority()
    .certified_key("target.test")
    .unwrap();
  assert_eq!(&cached.cert[0][..], &leaf[..]);
  assert_eq!(cached.cert[1], root);
}

#[tokio::test]
async fn sender_reaches_https_origin() {
  let ca = CertificateAuthority::generate().unwrap();
  let origin = TlsProvider::new(ca).unwrap();
  let listener = origin.bind_server("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let head = read_head(&mut socket).await;
    let body = if head.starts_with("GET /secure HTTP/1.1\r\n") {
      "hi"
    } else {
      "no"
    };
    let reply = format!(
      "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      body.len(),
      body
    );
    socket.write_all(reply.as_bytes()).await.unwrap();
    socket.shutdown().await.ok();
  });

  let sender = HttpSender::builder()
    .param(ConnectionParam::default().timeout(Some(Duration::from_secs(5))))
    .build()
    .unwrap();
  let raw = format!("GET https://127.0.0.1:{}/secure HTTP/1.1\r\n\r\n", addr.port());
  let mut msg = Message::parse_request(&raw, "").unwrap();
  assert!(msg.request_header().is_secure());
  sender.send(&mut msg, false).await.unwrap();
  assert_eq!(msg.response_header().status_code(), 200);
  assert_eq!(msg.response_body().text(), "hi");
}

#[tokio::test]
async fn client_certificate_mode_can_be_toggled() {
  let provider = TlsProvider::with_generated_ca().unwrap();
  assert!(!provider.is_client_cert_enabled());
  let ca = provider.certificate_authority();
  let (chain, _) = ca.issue("client.test").unwrap();
  assert_eq!(chain.len(), 2);
  provider.set_client_cert_enabled(true);
  assert!(provider.is_client_cert_enabled());
  provider.set_client_identity(None).unwrap();
  assert!(!provider.is_client_cert_enabled());
}

#[tokio::test]
async fn https_through_the_chain_is_tunnelled() {
  let (addr, seen) = tunnel_proxy(None).await;
  let sender = chained_sender(ProxyChain::new("127.0.0.1", addr.port()));
  let mut msg = Message::parse_request("GET https://origin.test/vault HTTP/1.1\r\n\r\n", "").unwrap();
  sender.send(&mut msg, false).await.unwrap();
  assert_eq!(msg.response_body().text(), "secret");
  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 2);
  assert!(seen[0].starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
  assert!(seen[1].starts_with("GET /vault HTTP/1.1\r\n"));
  assert!(seen[1].contains("Host: origin.test\r\n"));
}

#[tokio::test]
async fn tunnel_answers_basic_proxy_challenge() {
  let expected = encode_basic_auth("alice", Some("s3cret"));
  let (addr, seen) = tunnel_proxy(Some(expected.clone())).await;
  let chain = ProxyChain::new("127.0.0.1", addr.port()).credentials(ProxyCredentials {
    username: "alice".to_string(),
    password: "s3cret".to_string(),
    realm: None,
  });
  let sender = chained_sender(chain);
  let mut msg = Message::parse_request("GET https://origin.test/vault HTTP/1.1\r\n\r\n", "").unwrap();
  sender.send(&mut msg, false).await.unwrap();
  assert_eq!(msg.response_header().status_code(), 200);
  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 3);
  assert!(!seen[0].contains("Proxy-Authorization"));
  assert!(seen[1].starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
  assert!(seen[1].contains(&expected));
  assert!(seen[2].starts_with("GET /vault HTTP/1.1\r\n"));
}

#[tokio::test]
async fn refused_tunnel_is_io_error() {
  let (addr, _) = tunnel_proxy(Some("Basic bm9ib2R5".to_string())).await;
  let sender = chained_sender(ProxyChain::new("127.0.0.1", addr.port()));
  let mut msg = Message::parse_request("GET https://origin.test/ HTTP/1.1\r\n\r\n", "").unwrap();
  let err = sender.send(&mut msg, false).await.unwrap_err();
  assert!(err.is_io());
}
