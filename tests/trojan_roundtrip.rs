use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use trojan_kit::address::Socksaddr;
use trojan_kit::buf::Buffer;
use trojan_kit::network::{
    copy_buffered, Context, Metadata, PacketConn, PacketHandler, PacketRead, PacketWrite,
    StreamHandler, TransportStream,
};
use trojan_kit::trojan::{self, ClientConn, ClientPacketConn, Service};

/// Echoes everything back and reports which user each request ran as.
struct Echo {
    seen: mpsc::UnboundedSender<(String, String)>,
}

impl Echo {
    fn report(&self, ctx: &Context, metadata: &Metadata) {
        let user = ctx.user::<String>().cloned().unwrap_or_default();
        let destination = metadata
            .destination
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        let _ = self.seen.send((user, destination));
    }
}

#[async_trait]
impl StreamHandler for Echo {
    async fn new_connection(
        &self,
        ctx: Context,
        conn: TransportStream,
        metadata: Metadata,
    ) -> anyhow::Result<()> {
        self.report(&ctx, &metadata);
        let (mut rd, mut wr) = tokio::io::split(conn);
        tokio::io::copy(&mut rd, &mut wr).await?;
        wr.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for Echo {
    async fn new_packet_connection(
        &self,
        ctx: Context,
        mut conn: Box<dyn PacketConn>,
        metadata: Metadata,
    ) -> anyhow::Result<()> {
        self.report(&ctx, &metadata);
        loop {
            let mut buffer = Buffer::with_reserve(2048, conn.front_headroom(), 0);
            let destination = match conn.read_packet(&mut buffer).await {
                Ok(destination) => destination,
                Err(e) if e.is_closed_or_canceled() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            conn.write_packet(buffer, &destination).await?;
        }
    }
}

type EchoService = Service<String, Echo>;

fn echo_service() -> (Arc<EchoService>, mpsc::UnboundedReceiver<(String, String)>) {
    let (seen, rx) = mpsc::unbounded_channel();
    let mut service = Service::new(Echo { seen });
    service.add_user("alice".to_string(), "alice-pw").unwrap();
    service.add_user("bob".to_string(), "bob-pw").unwrap();
    (Arc::new(service), rx)
}

fn accept(service: &Arc<EchoService>, server: tokio::io::DuplexStream) {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        let metadata = Metadata::from_source("198.51.100.1:1234".parse().unwrap());
        let _ = service
            .new_connection(Context::new(), Box::pin(server), metadata)
            .await;
    });
}

#[tokio::test]
async fn test_stream_roundtrip_through_service() {
    let (service, mut seen) = echo_service();
    let (client, server) = duplex(8192);
    accept(&service, server);

    let destination = Socksaddr::fqdn("example.org", 80);
    let mut conn = ClientConn::new(client, trojan::key("bob-pw"), destination);
    conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    conn.write_all(b"second write").await.unwrap();
    conn.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    conn.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"GET / HTTP/1.1\r\n\r\nsecond write");

    let (user, destination) = seen.recv().await.unwrap();
    assert_eq!(user, "bob");
    assert_eq!(destination, "example.org:80");
}

#[tokio::test]
async fn test_copy_buffered_through_client_conn() {
    let (service, mut seen) = echo_service();
    let (client, server) = duplex(64 * 1024);
    accept(&service, server);

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let (mut rd, wr) = tokio::io::split(client);
    let destination = Socksaddr::ipv4([10, 0, 0, 1], 443);
    let mut writer = ClientConn::new(wr, trojan::key("alice-pw"), destination);

    let mut source = payload.as_slice();
    let copied = copy_buffered(&mut source, &mut writer, 4096).await.unwrap();
    assert_eq!(copied, payload.len() as u64);
    writer.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    rd.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    let (user, destination) = seen.recv().await.unwrap();
    assert_eq!(user, "alice");
    assert_eq!(destination, "10.0.0.1:443");
}

#[tokio::test]
async fn test_packet_roundtrip_through_service() {
    let (service, mut seen) = echo_service();
    let (client, server) = duplex(8192);
    accept(&service, server);

    let mut conn = ClientPacketConn::new(client, trojan::key("alice-pw"));
    let dns = Socksaddr::ipv4([8, 8, 8, 8], 53);
    let ntp = Socksaddr::fqdn("pool.ntp.org", 123);

    conn.write_to(b"query one", &dns).await.unwrap();
    conn.write_to(b"query two", &ntp).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = conn.read_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"query one");
    assert_eq!(from, dns);
    let (n, from) = conn.read_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"query two");
    assert_eq!(from, ntp);

    let (user, destination) = seen.recv().await.unwrap();
    assert_eq!(user, "alice");
    assert_eq!(destination, "8.8.8.8:53");
}

#[tokio::test]
async fn test_removed_user_is_rejected() {
    let (seen, _rx) = mpsc::unbounded_channel();
    let mut service = Service::new(Echo { seen });
    service.add_user("carol".to_string(), "carol-pw").unwrap();
    assert!(service.remove_user(&"carol".to_string()));

    let (client, server) = duplex(4096);
    let mut conn = ClientConn::new(client, trojan::key("carol-pw"), Socksaddr::fqdn("a.b", 1));
    conn.write_all(b"x").await.unwrap();

    let err = service
        .new_connection(
            Context::new(),
            Box::pin(server),
            Metadata::from_source("198.51.100.2:9".parse().unwrap()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("authentication failed"));
}
