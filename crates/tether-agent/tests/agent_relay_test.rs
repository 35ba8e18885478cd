//! Agent against a real relay server, over plain TCP and TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_agent::{Agent, AgentConfig, AgentError};
use tether_control::{ControlConfig, ControlHandler, RandomPortAllocator, RelayServer, SessionRegistry};
use tether_transport::{
    PlainAcceptor, ServerVerification, TcpConnector, TlsConnector, TlsServerAcceptor,
    TransportAcceptor, TransportConnector,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_agent=debug,tether_control=debug")
        .with_test_writer()
        .try_init();
}

async fn start_relay(
    acceptor: Arc<dyn TransportAcceptor>,
) -> (SocketAddr, SessionRegistry, oneshot::Sender<()>, JoinHandle<()>) {
    let config = ControlConfig::default();
    let allocator = Arc::new(RandomPortAllocator::new(config.bind_ip, config.port_range));
    let handler = Arc::new(ControlHandler::new(SessionRegistry::new(), allocator, config));
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), acceptor, handler)
        .await
        .unwrap();

    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));
    (addr, registry, tx, task)
}

/// Target that answers each connection once and hangs up.
///
/// Reads a 4-byte request and replies with `re:` + request.
async fn start_target() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 4];
                if stream.read_exact(&mut request).await.is_ok() {
                    let mut response = b"re:".to_vec();
                    response.extend_from_slice(&request);
                    let _ = stream.write_all(&response).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

fn public_socket(public_addr: &str) -> SocketAddr {
    let port: u16 = public_addr.rsplit_once(':').unwrap().1.parse().unwrap();
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn request(public: SocketAddr, body: &[u8; 4]) -> Vec<u8> {
    let mut client = TcpStream::connect(public).await.unwrap();
    client.write_all(body).await.unwrap();

    let mut response = vec![0u8; 7];
    timeout(TIMEOUT, client.read_exact(&mut response))
        .await
        .expect("timed out waiting for response")
        .unwrap();
    response
}

async fn run_requests(connector: &dyn TransportConnector, acceptor: Arc<dyn TransportAcceptor>) {
    init_tracing();
    let target = start_target().await;
    let (relay_addr, registry, shutdown, relay_task) = start_relay(acceptor).await;

    let agent = Agent::connect(AgentConfig::new(relay_addr.to_string(), target), connector)
        .await
        .unwrap();
    let public = public_socket(agent.public_addr());
    assert_eq!(registry.count(), 1);
    let agent_task = tokio::spawn(agent.run());

    assert_eq!(request(public, b"abcd").await, b"re:abcd");

    // Let both sides leave relay mode before the next Incoming
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(request(public, b"wxyz").await, b"re:wxyz");

    let _ = shutdown.send(());
    timeout(TIMEOUT, relay_task).await.unwrap().unwrap();

    let result = timeout(TIMEOUT, agent_task).await.unwrap().unwrap();
    assert!(matches!(result, Err(AgentError::ConnectionLost) | Err(AgentError::Codec(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_serves_requests_over_tcp() {
    run_requests(&TcpConnector, Arc::new(PlainAcceptor)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_serves_requests_over_tls() {
    let cert = tether_cert::generate_self_signed_cert().unwrap();
    let acceptor = TlsServerAcceptor::new(cert.into_certificate()).unwrap();
    let connector = TlsConnector::new("localhost", ServerVerification::Insecure).unwrap();

    run_requests(&connector, Arc::new(acceptor)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_target_closes_public_connection() {
    init_tracing();
    let dead_target = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().to_string()
    };
    let (relay_addr, registry, shutdown, relay_task) = start_relay(Arc::new(PlainAcceptor)).await;

    let agent = Agent::connect(
        AgentConfig::new(relay_addr.to_string(), dead_target),
        &TcpConnector,
    )
    .await
    .unwrap();
    let public = public_socket(agent.public_addr());
    let _agent_task = tokio::spawn(agent.run());

    let mut client = TcpStream::connect(public).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(TIMEOUT, client.read(&mut buf))
        .await
        .expect("public connection was not closed");
    assert_eq!(read.unwrap_or(0), 0);

    // Session survives the declined request
    assert_eq!(registry.count(), 1);

    let _ = shutdown.send(());
    timeout(TIMEOUT, relay_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_relay_unreachable() {
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().to_string()
    };

    let result = Agent::connect(AgentConfig::new(addr, "127.0.0.1:1"), &TcpConnector).await;
    assert!(matches!(result, Err(AgentError::Transport(_))));
}
