use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use longshore_operator::appstate::MonitorCommand;
use longshore_operator::channel::ChannelClient;
use longshore_operator::deploy::WorkOrder;
use longshore_wire::{
    AppInformersSpec, ApplicationManifests, ControlFrame, FrameCodec,
    OperatorFrame, Welcome,
};

type ServerSide = Framed<TcpStream, FrameCodec<OperatorFrame, ControlFrame>>;

struct Harness {
    listener: TcpListener,
    orders: mpsc::Receiver<WorkOrder>,
    monitor: mpsc::Receiver<MonitorCommand>,
    cancel: CancellationToken,
}

async fn start_client(token: &str) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (orders_tx, orders) = mpsc::channel(4);
    let (monitor_tx, monitor) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let client = ChannelClient::new(
        addr,
        token.to_string(),
        orders_tx,
        monitor_tx,
        cancel.clone(),
    );
    tokio::spawn(client.run());
    Harness {
        listener,
        orders,
        monitor,
        cancel,
    }
}

async fn accept(listener: &TcpListener) -> ServerSide {
    let (stream, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    Framed::new(stream, FrameCodec::new())
}

async fn read_frame(conn: &mut ServerSide) -> OperatorFrame {
    timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("read timed out")
        .expect("connection closed")
        .expect("decode failed")
}

#[tokio::test]
async fn hello_welcome_then_commands_flow_to_the_queues() {
    let mut h = start_client("s3cret").await;
    let mut conn = accept(&h.listener).await;

    match read_frame(&mut conn).await {
        OperatorFrame::Hello(hello) => {
            assert_eq!(hello.token, "s3cret");
            assert_eq!(hello.version, env!("CARGO_PKG_VERSION"));
        }
        other => panic!("expected hello, got {other:?}"),
    }

    conn.send(ControlFrame::Welcome(Welcome {
        ping_interval_secs: Some(1),
    }))
    .await
    .unwrap();

    let manifests = ApplicationManifests {
        app_id: "app-1".into(),
        ..Default::default()
    };
    conn.send(ControlFrame::Deploy(Box::new(manifests)))
        .await
        .unwrap();
    match timeout(Duration::from_secs(5), h.orders.recv())
        .await
        .unwrap()
        .unwrap()
    {
        WorkOrder::Deploy(cmd) => assert_eq!(cmd.app_id, "app-1"),
        other => panic!("expected deploy order, got {other:?}"),
    }

    conn.send(ControlFrame::AppInformers(AppInformersSpec {
        app_id: "app-1".into(),
        informers: vec!["deploy/web".into()],
    }))
    .await
    .unwrap();
    let MonitorCommand::Apply { app_id, informers } =
        timeout(Duration::from_secs(5), h.monitor.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(app_id, "app-1");
    assert_eq!(informers, vec!["deploy/web".to_string()]);

    h.cancel.cancel();
}

#[tokio::test]
async fn heartbeat_follows_the_welcome_interval() {
    let h = start_client("tok").await;
    let mut conn = accept(&h.listener).await;
    assert!(matches!(
        read_frame(&mut conn).await,
        OperatorFrame::Hello(_)
    ));

    conn.send(ControlFrame::Welcome(Welcome {
        ping_interval_secs: Some(1),
    }))
    .await
    .unwrap();

    // a 1s interval must produce a ping well within 3s
    let frame = timeout(Duration::from_secs(3), conn.next())
        .await
        .expect("no ping within the heartbeat interval")
        .unwrap()
        .unwrap();
    assert!(matches!(frame, OperatorFrame::Ping));
    conn.send(ControlFrame::Pong).await.unwrap();

    h.cancel.cancel();
}

#[tokio::test]
async fn a_silent_server_is_abandoned_and_redialed() {
    let h = start_client("tok").await;

    // first attempt: read the hello but never welcome; the client gives up
    // after the welcome grace and redials
    let mut conn = accept(&h.listener).await;
    assert!(matches!(
        read_frame(&mut conn).await,
        OperatorFrame::Hello(_)
    ));

    let mut conn = accept(&h.listener).await;
    assert!(matches!(
        read_frame(&mut conn).await,
        OperatorFrame::Hello(_)
    ));
    conn.send(ControlFrame::Welcome(Welcome {
        ping_interval_secs: None,
    }))
    .await
    .unwrap();

    h.cancel.cancel();
}

#[tokio::test]
async fn client_redials_after_the_connection_drops() {
    let h = start_client("tok").await;

    let mut conn = accept(&h.listener).await;
    assert!(matches!(
        read_frame(&mut conn).await,
        OperatorFrame::Hello(_)
    ));
    drop(conn);

    // redial comes after the flat reconnect delay
    let mut conn = accept(&h.listener).await;
    match read_frame(&mut conn).await {
        OperatorFrame::Hello(hello) => assert_eq!(hello.token, "tok"),
        other => panic!("expected hello, got {other:?}"),
    }

    h.cancel.cancel();
}
