use comm_core::{envelope::attr, Comm, CommConfig, Endpoint, Envelope, SERVER_QUIT};
use repo_server::{server::field, Repository, RepositoryServer};
use std::{fs, time::Duration};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct Setup {
    dir: TempDir,
    server: RepositoryServer,
    client: Comm,
}

impl Setup {
    async fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let repository = Repository::new(dir.path().join("storage"), dir.path().join("staging"))?;
        let server = RepositoryServer::new(Endpoint::new("127.0.0.1", 0), repository);
        server.start().await?;

        fs::create_dir_all(dir.path().join("send"))?;
        let config = CommConfig::new()
            .send_path(dir.path().join("send"))
            .save_path(dir.path().join("received"));
        let client = Comm::with_config(Endpoint::new("127.0.0.1", 0), "client", config);
        client.start().await?;
        Ok(Self { dir, server, client })
    }

    fn request(&self, command: &str) -> Envelope {
        Envelope::request(command, &self.client.local_endpoint(), &self.server.endpoint())
    }

    async fn ask(&self, request: Envelope) -> anyhow::Result<Envelope> {
        self.client.post_message(request);
        Ok(tokio::time::timeout(WAIT, self.client.get_message()).await?)
    }

    async fn upload(&self, name: &str, contents: &[u8]) -> anyhow::Result<Envelope> {
        fs::write(self.dir.path().join("send").join(name), contents)?;
        self.ask(self.request("checkIn").with(attr::FILE, name)).await
    }

    async fn shutdown(self) {
        self.client.stop().await;
        self.server.stop().await;
    }
}

#[tokio::test]
async fn check_in_and_check_out_a_file() -> anyhow::Result<()> {
    let setup = Setup::new().await?;
    let contents = vec![42u8; 5000];

    let staged = setup.upload("data.bin", &contents).await?;
    assert!(!staged.is_error(), "{staged}");
    assert_eq!(staged.get(field::STAGED), Some("data.bin"));

    let committed = setup
        .ask(
            setup
                .request("checkInFiles")
                .with(field::NAME, "data.bin")
                .with(field::DESCRIPTION, "test data")
                .with(field::CLOSE, "true"),
        )
        .await?;
    assert_eq!(committed.get(field::KEY), Some("data.bin.1"));
    assert_eq!(committed.get(field::STATUS), Some("Closed"));

    let checked_out = setup
        .ask(setup.request("checkOutFiles").with(field::KEY, "data.bin"))
        .await?;
    assert_eq!(checked_out.file(), Some("data.bin.1"));
    let received = setup.dir.path().join("received").join("data.bin.1");
    assert_eq!(fs::read(received)?, contents);

    let listed = setup.ask(setup.request("getFiles")).await?;
    assert_eq!(listed.get("file1"), Some("data.bin.1"));

    let browsed = setup.ask(setup.request("browseDescription")).await?;
    assert_eq!(browsed.get("description1"), Some("data.bin.1: test data"));

    setup.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failures_come_back_as_error_replies() -> anyhow::Result<()> {
    let setup = Setup::new().await?;

    let reply = setup
        .ask(setup.request("metadataContent").with(field::KEY, "nothing"))
        .await?;
    assert!(reply.is_error());
    assert_eq!(reply.command(), "metadataContent");

    let reply = setup
        .ask(setup.request("getDirs").with(field::PATH, "../.."))
        .await?;
    assert!(reply.is_error());

    let reply = setup
        .ask(setup.request("checkInFiles").with(field::NAME, "never-uploaded.txt"))
        .await?;
    assert!(reply.is_error());

    setup.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn client_can_quit_the_server() -> anyhow::Result<()> {
    let setup = Setup::new().await?;

    let echoed = setup.ask(setup.request("echo").with("body", "ping")).await?;
    assert_eq!(echoed.get("body"), Some("ping"));

    setup.client.post_message(setup.request(SERVER_QUIT));
    tokio::time::timeout(WAIT, setup.server.finished()).await?;
    setup.shutdown().await;
    Ok(())
}
