use privd::{Client, Config, Executor, Registry, Secret, Server, System};
use std::{fs, sync::Arc, time::Duration};
use tokio::{
    net::UnixStream,
    time::{sleep, timeout},
};

fn nofile_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

fn set_nofile_limit(limit: &libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) }, 0);
}

// The limit is process-wide, keep this the only test in the binary.
#[tokio::test(flavor = "multi_thread")]
async fn test_descriptor_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("privd.sock");
    let secret = Secret::new("abc123").unwrap();

    let executor = Arc::new(Executor::new(Duration::from_secs(10)));
    let backend = Arc::new(System::new(&Config::default()));
    let server = Server::bind(
        &path,
        Arc::new(secret.clone()),
        Arc::new(Registry::new(backend, executor)),
    )
    .unwrap();
    let serving = tokio::spawn(server.serve());

    let saved = nofile_limit();
    let open = fs::read_dir("/proc/self/fd").unwrap().count() as libc::rlim_t;
    set_nofile_limit(&libc::rlimit {
        rlim_cur: open + 16,
        rlim_max: saved.rlim_max,
    });

    // Queue connections until the daemon runs out of descriptors.
    let mut streams = Vec::new();
    for _ in 0..64 {
        match UnixStream::connect(&path).await {
            Ok(stream) => streams.push(stream),
            Err(_) => break,
        }
    }
    sleep(Duration::from_millis(300)).await;

    drop(streams);
    set_nofile_limit(&saved);

    assert!(!serving.is_finished(), "server stopped accepting");

    let mut client = timeout(Duration::from_secs(5), Client::connect(&path, &secret))
        .await
        .expect("server does not accept")
        .unwrap();
    client.test_read_devices(&[]).await.unwrap();
}
