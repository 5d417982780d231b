//! Whole-cage scenarios: configuration-driven pools and interfaces, and
//! hot reload through the maintenance loop.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use aviary::{request::Request, Cage, CageOptions, Value};
use futures::FutureExt;

struct Scaffold {
    _root: tempfile::TempDir,
    cages_dir: PathBuf,
    cage_dir: PathBuf,
}

fn scaffold(files: &[(&str, String)]) -> Scaffold {
    let root = tempfile::tempdir().unwrap();
    let cages_dir = root.path().to_path_buf();
    let cage_dir = cages_dir.join("test");
    std::fs::create_dir(cages_dir.join(".shared")).unwrap();
    std::fs::create_dir(&cage_dir).unwrap();
    for (name, content) in files {
        std::fs::write(cage_dir.join(name), content).unwrap();
    }
    Scaffold {
        _root: root,
        cages_dir,
        cage_dir,
    }
}

fn cage(scaffold: &Scaffold) -> Cage {
    let mut options = CageOptions::new("node1", "test", &scaffold.cages_dir);
    options.config_cache_timeout = Duration::from_millis(100);
    options.config_settle_timeout = Duration::from_millis(200);
    Cage::new(options).unwrap()
}

fn interfaces_config(interfaces: &str) -> String {
    format!(
        "config:\n  thread_count: 2\n  sweep_period: 1\n  request_timeout: 5\n  interfaces: {interfaces}\n"
    )
}

async fn wait_until(what: &str, limit: Duration, mut done: impl FnMut() -> bool) {
    let give_up = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < give_up, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_driven_pool_serves_transactions() {
    let scaffold = scaffold(&[
        ("config_interfaces.yaml", interfaces_config("[]")),
        (
            "config_resource_callable_9.yaml",
            "config:\n  protocol: callable\n  pool__size: 2\n".to_string(),
        ),
    ]);
    let cage = cage(&scaffold);
    cage.start().await;

    let request = Request::fake(Duration::from_secs(5));
    let mut xa = cage.transaction(&request, Default::default());
    xa.participant("callable_9").execute(
        vec![Value::from("{a}")],
        aviary::value_map! { "a" => "foo" },
    );
    assert_eq!(xa.execute().await.unwrap(), vec![Value::from("foo")]);

    let pool = cage.pools().get("callable_9").unwrap();
    assert_eq!(pool.counts(), (0, 1));

    cage.stop().await;
    assert_eq!(pool.counts(), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_interface_restarts_on_config_change() {
    let drop_dir = tempfile::tempdir().unwrap();
    let scans = Arc::new(AtomicUsize::new(0));

    let scaffold = scaffold(&[
        ("config_interfaces.yaml", interfaces_config("[file_1]")),
        (
            "config_interface_file_1.yaml",
            format!(
                "config:\n  protocol: file\n  interval: 10\n  source_dir: {}\n  handler: probe\n",
                drop_dir.path().display()
            ),
        ),
    ]);
    let cage = cage(&scaffold);

    // the handler always fails, so the dropped file stays in place and
    // every scan is observable as one more attempt
    let counter = scans.clone();
    cage.register_handler(
        "probe",
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            async { Err(aviary::Error::unclassified("keep the file")) }.boxed()
        }),
    );

    std::fs::write(drop_dir.path().join("poke.msg"), b"x").unwrap();
    cage.start().await;

    // one scan happens promptly, then the 10 s interval keeps it quiet
    wait_until("the first scan", Duration::from_secs(3), || {
        scans.load(Ordering::Relaxed) >= 1
    })
    .await;
    let first_instance = cage.get_interface("file_1").unwrap().instance_id();

    std::fs::write(
        scaffold.cage_dir.join("config_interface_file_1.yaml"),
        format!(
            "config:\n  protocol: file\n  interval: 0.2\n  source_dir: {}\n  handler: probe\n",
            drop_dir.path().display()
        ),
    )
    .unwrap();

    // drive maintenance until the settled config change restarts the
    // interface under a new instance id
    let give_up = Instant::now() + Duration::from_secs(5);
    loop {
        cage.maintenance().await;
        let instance = cage.get_interface("file_1").unwrap().instance_id();
        if instance != first_instance {
            break;
        }
        assert!(Instant::now() < give_up, "interface never restarted");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // the new instance scans at the faster cadence
    let before = scans.load(Ordering::Relaxed);
    wait_until("faster scans", Duration::from_secs(3), || {
        scans.load(Ordering::Relaxed) >= before + 3
    })
    .await;

    cage.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn maintenance_reconciles_the_interface_set() {
    let scaffold = scaffold(&[
        ("config_interfaces.yaml", interfaces_config("[schedule_1]")),
        (
            "config_interface_schedule_1.yaml",
            "config:\n  protocol: schedule\n  period: 0.05\n  handler: beat\n".to_string(),
        ),
    ]);
    let cage = cage(&scaffold);
    let beats = Arc::new(AtomicUsize::new(0));
    let counter = beats.clone();
    cage.register_handler(
        "beat",
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            async { Ok(Value::Null) }.boxed()
        }),
    );

    cage.start().await;
    assert!(cage.get_interface("schedule_1").is_some());
    wait_until("schedule firings", Duration::from_secs(3), || {
        beats.load(Ordering::Relaxed) >= 2
    })
    .await;

    // drop the interface from configuration; maintenance stops it
    std::fs::write(
        scaffold.cage_dir.join("config_interfaces.yaml"),
        interfaces_config("[]"),
    )
    .unwrap();
    let give_up = Instant::now() + Duration::from_secs(5);
    while cage.get_interface("schedule_1").is_some() {
        cage.maintenance().await;
        assert!(Instant::now() < give_up, "interface never stopped");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // a firing enqueued just before the stop may still drain through the
    // worker pool; once it has, the counter stays put
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after = beats.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(beats.load(Ordering::Relaxed), after);

    cage.stop().await;
}
