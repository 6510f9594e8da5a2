use duplex_core::call::CallOptions;
use duplex_core::connect::client::ConnectClient;
use duplex_core::grpc::client::GrpcClient;
use greet_service::pb::{GreetRequest, GreetResponse};
use greet_service::GREET_PATH;
use scripted_greeter::{ScriptedGreeter, greetings, matt, spawn_gateway, spawn_gateway_with};
use std::sync::Arc;
use std::time::Duration;


#[tokio::test]
async fn test_shutdown_drains_in_flight_streams() {
    let handler = ScriptedGreeter::new(5).with_delay(Duration::from_millis(50));
    let gateway = spawn_gateway(Arc::new(handler)).await;
    let url = gateway.url();
    let addr = gateway.local_addr();

    let mut connect = ConnectClient::new(&url)
        .unwrap()
        .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, &matt(), CallOptions::default())
        .await
        .unwrap();
    let mut grpc = GrpcClient::connect(&url)
        .await
        .unwrap()
        .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, matt(), CallOptions::default())
        .await
        .unwrap();

    // Both calls are streaming before the shutdown starts.
    assert!(connect.message().await.unwrap().is_some());
    assert!(grpc.message().await.unwrap().is_some());

    let shutdown = tokio::spawn(gateway.shutdown());

    let expected = vec!["matt 2", "matt 3", "matt 4", "matt 5"];
    assert_eq!(greetings(&connect.collect().await.unwrap()), expected);
    assert_eq!(greetings(&grpc.collect().await.unwrap()), expected);

    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The socket is released once the gateway stopped.
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_grace_period_bounds_the_shutdown() {
    let handler = Arc::new(ScriptedGreeter::new(10_000).with_delay(Duration::from_millis(50)));
    let probe = handler.probe.clone();
    let gateway = spawn_gateway_with(handler, Duration::from_millis(200)).await;

    let mut responses = ConnectClient::new(&gateway.url())
        .unwrap()
        .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, &matt(), CallOptions::default())
        .await
        .unwrap();
    assert!(responses.message().await.unwrap().is_some());

    tokio::time::timeout(Duration::from_secs(5), gateway.shutdown())
        .await
        .unwrap()
        .unwrap();

    // The abandoned stream fails instead of hanging.
    let outcome = tokio::time::timeout(Duration::from_secs(5), responses.collect())
        .await
        .unwrap();
    assert!(outcome.is_err());

    tokio::time::timeout(Duration::from_secs(5), probe.idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_token_stops_the_gateway() {
    let gateway = spawn_gateway(Arc::new(ScriptedGreeter::new(1))).await;
    let token = gateway.shutdown_token();

    let waiting = tokio::spawn(gateway.wait());
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_new_connections_are_refused_while_draining() {
    let handler = ScriptedGreeter::new(10_000).with_delay(Duration::from_millis(20));
    let gateway = spawn_gateway_with(Arc::new(handler), Duration::from_secs(3)).await;
    let url = gateway.url();
    let addr = gateway.local_addr();

    let mut in_flight = ConnectClient::new(&url)
        .unwrap()
        .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, &matt(), CallOptions::default())
        .await
        .unwrap();
    assert!(in_flight.message().await.unwrap().is_some());

    let shutdown = tokio::spawn(gateway.shutdown());

    // The listener closes as soon as the shutdown starts, well before the grace period.
    tokio::time::timeout(Duration::from_secs(1), async {
        while tokio::net::TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let refused = tokio::time::timeout(
        Duration::from_secs(1),
        ConnectClient::new(&url)
            .unwrap()
            .server_streaming::<GreetRequest, GreetResponse>(
                GREET_PATH,
                &matt(),
                CallOptions::default(),
            ),
    )
    .await
    .unwrap();
    assert!(refused.is_err());

    // The call that was already running keeps streaming.
    assert!(in_flight.message().await.unwrap().is_some());

    tokio::time::timeout(Duration::from_secs(10), shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
