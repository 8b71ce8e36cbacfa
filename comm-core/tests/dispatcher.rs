use comm_core::{Comm, Dispatcher, Endpoint, Envelope};
use std::time::Duration;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(10);

async fn echo_server() -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new(Comm::new(Endpoint::new("127.0.0.1", 0), "server"));
    dispatcher.add_handler("echo", |request| {
        let body = request.get("body").unwrap_or_default().to_string();
        request.reply().with("body", body)
    });
    dispatcher.start().await?;
    dispatcher.run();
    Ok(dispatcher)
}

async fn client() -> anyhow::Result<Comm> {
    let comm = Comm::new(Endpoint::new("127.0.0.1", 0), "client");
    comm.start().await?;
    Ok(comm)
}

#[tokio::test]
async fn reply_swaps_from_and_to() -> anyhow::Result<()> {
    let server = echo_server().await?;
    let client = client().await?;
    let server_endpoint = server.comm().local_endpoint();

    client.post_message(
        Envelope::request("echo", &client.local_endpoint(), &server_endpoint).with("body", "hi"),
    );
    let reply = tokio::time::timeout(WAIT, client.get_message()).await?;
    assert_eq!(reply.command(), "echo");
    assert_eq!(reply.from()?, server_endpoint);
    assert_eq!(reply.to()?, client.local_endpoint());
    assert_eq!(reply.get("body"), Some("hi"));

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn unknown_command_gets_no_reply() -> anyhow::Result<()> {
    let server = echo_server().await?;
    let client = client().await?;
    let me = client.local_endpoint();
    let to = server.comm().local_endpoint();

    client.post_message(Envelope::request("frobnicate", &me, &to));
    client.post_message(Envelope::request("echo", &me, &to).with("body", "still here"));

    let reply = tokio::time::timeout(WAIT, client.get_message()).await?;
    assert_eq!(reply.command(), "echo");
    assert_eq!(reply.get("body"), Some("still here"));
    assert!(client.try_get_message().is_none());
    assert!(logs_contain("No handler registered for command `frobnicate`"));

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn idle_dispatcher_stops() -> anyhow::Result<()> {
    let server = echo_server().await?;
    tokio::time::timeout(Duration::from_secs(2), server.stop()).await?;
    assert!(server.comm().try_get_message().is_none());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn reply_to_self_is_not_posted() -> anyhow::Result<()> {
    let server = echo_server().await?;
    let me = server.comm().local_endpoint();

    // A request that claims to come from the server itself
    server.comm().inbound().enqueue(Envelope::request("echo", &me, &me));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(logs_contain("Not posting a reply addressed to this dispatcher"));
    assert!(server.comm().try_get_message().is_none());

    server.stop().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn verbose_requests_are_logged_in_full() -> anyhow::Result<()> {
    let server = echo_server().await?;
    let client = client().await?;

    client.post_message(
        Envelope::request("echo", &client.local_endpoint(), &server.comm().local_endpoint())
            .with("verbose", "")
            .with("body", "loud"),
    );
    tokio::time::timeout(WAIT, client.get_message()).await?;
    assert!(logs_contain(r#"("body", "loud")"#));

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn peer_can_quit_the_dispatcher() -> anyhow::Result<()> {
    let server = echo_server().await?;
    let client = client().await?;

    client.post_message(Envelope::request(
        comm_core::SERVER_QUIT,
        &client.local_endpoint(),
        &server.comm().local_endpoint(),
    ));
    tokio::time::timeout(WAIT, server.finished()).await?;
    server.stop().await;
    client.stop().await;
    Ok(())
}
