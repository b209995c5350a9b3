//! End-to-end engine tests against a local fixture server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use spinneret::{
    Context, Executor, ExecutorConfig, JsonFilePipeline, ParseResult, Pipeline, Rule,
};

const LIST_PAGE: &str = r#"
    <html><body>
      <ul class="list">
        <li><a href="/detail/1">One</a></li>
        <li><a href="/detail/2">Two</a></li>
        <li><a href="/detail/3">Three</a></li>
      </ul>
    </body></html>
"#;

fn detail_page(title: &str) -> String {
    format!(r#"<html><body><h1 class="title">{title}</h1></body></html>"#)
}

fn detail_parse(ctx: &mut Context<'_>) -> ParseResult<()> {
    ctx.html("h1.title", |ctx, heading| {
        ctx.item(json!({ "title": heading.text() }))
    })?;
    Ok(())
}

fn fast_config(dir: &std::path::Path) -> ExecutorConfig {
    ExecutorConfig {
        fleet_size: 1,
        concurrency: 20,
        err_limit: 3,
        host_interval: Duration::from_millis(10),
        instance_root: dir.to_path_buf(),
        dump_parse_failures: false,
    }
}

async fn wait_for(task: &spinneret::Task) {
    tokio::time::timeout(Duration::from_secs(30), task.wait())
        .await
        .expect("task did not terminate in time");
}

#[tokio::test]
async fn happy_path_list_and_details() {
    struct ListRule {
        seed: String,
        output: std::path::PathBuf,
    }

    impl Rule for ListRule {
        fn seed_links(&self) -> Vec<String> {
            vec![self.seed.clone()]
        }

        fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
            ctx.html("ul.list li a", |ctx, anchor| {
                let href = anchor.attr("href")?;
                ctx.follow(&href, detail_parse)
            })?;
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            vec![Arc::new(JsonFilePipeline::new(&self.output))]
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LIST_PAGE))
        .mount(&server)
        .await;
    for (id, title) in [(1, "T1"), (2, "T2"), (3, "T3")] {
        Mock::given(method("GET"))
            .and(path(format!("/detail/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(detail_page(title)))
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("items.json");
    let executor = Executor::direct(fast_config(dir.path())).await;

    let task = executor
        .accept(ListRule {
            seed: format!("{}/list", server.uri()),
            output: output.clone(),
        })
        .await
        .unwrap();
    wait_for(&task).await;

    let counters = task.counters();
    assert_eq!(counters.completed_commands, 4);
    assert_eq!(counters.failed_commands, 0);
    assert_eq!(counters.running_commands, 0);
    assert_eq!(counters.completed_items, 3);
    assert_eq!(counters.total_commands(), 4);
    assert_eq!(counters.total_items(), 3);

    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    let mut titles: Vec<String> = parsed
        .iter()
        .map(|v| v["title"].as_str().unwrap().to_string())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["T1", "T2", "T3"]);

    executor.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    struct SeedOnly {
        seeds: Vec<String>,
    }

    impl Rule for SeedOnly {
        fn seed_links(&self) -> Vec<String> {
            self.seeds.clone()
        }

        fn parse(&self, _ctx: &mut Context<'_>) -> ParseResult<()> {
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    // The first two requests per seed fail, later ones succeed.
    for seed in ["/a", "/b"] {
        Mock::given(method("GET"))
            .and(path(seed))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(seed))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let executor = Executor::direct(fast_config(dir.path())).await;
    let task = executor
        .accept(SeedOnly {
            seeds: vec![
                format!("{}/a", server.uri()),
                format!("{}/b", server.uri()),
            ],
        })
        .await
        .unwrap();
    wait_for(&task).await;

    let counters = task.counters();
    assert_eq!(counters.completed_commands, 2);
    assert_eq!(counters.failed_commands, 0);

    // Three attempts per seed at most (two failures + one success).
    assert!(server.received_requests().await.unwrap().len() <= 6);

    executor.stop().await;
}

#[tokio::test]
async fn permanent_failures_exhaust_the_budget() {
    struct SeedOnly {
        seeds: Vec<String>,
    }

    impl Rule for SeedOnly {
        fn seed_links(&self) -> Vec<String> {
            self.seeds.clone()
        }

        fn parse(&self, _ctx: &mut Context<'_>) -> ParseResult<()> {
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.err_limit = 2;
    let executor = Executor::direct(config).await;

    let task = executor
        .accept(SeedOnly {
            seeds: vec![
                format!("{}/x", server.uri()),
                format!("{}/y", server.uri()),
            ],
        })
        .await
        .unwrap();
    wait_for(&task).await;

    let counters = task.counters();
    assert_eq!(counters.failed_commands, 2);
    assert_eq!(counters.completed_commands, 0);
    assert_eq!(counters.total_items(), 0);

    executor.stop().await;
}

#[tokio::test]
async fn per_host_interval_spaces_successful_requests() {
    struct SeedOnly {
        seeds: Vec<String>,
    }

    impl Rule for SeedOnly {
        fn seed_links(&self) -> Vec<String> {
            self.seeds.clone()
        }

        fn parse(&self, _ctx: &mut Context<'_>) -> ParseResult<()> {
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    const SEEDS: usize = 8;
    const INTERVAL: Duration = Duration::from_millis(100);

    let dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig {
        fleet_size: 1,
        concurrency: 5,
        err_limit: 3,
        host_interval: INTERVAL,
        instance_root: dir.path().to_path_buf(),
        dump_parse_failures: false,
    };
    let executor = Executor::direct(config).await;

    let seeds = (0..SEEDS)
        .map(|i| format!("{}/{i}", server.uri()))
        .collect();
    let started = Instant::now();
    let task = executor.accept(SeedOnly { seeds }).await.unwrap();
    wait_for(&task).await;
    let elapsed = started.elapsed();

    assert_eq!(task.counters().completed_commands, SEEDS as u64);
    // One downloader, one host: successful requests are spaced by at least
    // the interval, so the whole batch takes at least (SEEDS - 1) of them.
    assert!(
        elapsed >= INTERVAL * (SEEDS as u32 - 1),
        "batch finished too fast: {elapsed:?}"
    );

    executor.stop().await;
}

#[tokio::test]
async fn retry_bans_the_downloader_and_completes_on_a_fresh_one() {
    struct RetryOnce {
        seed: String,
        retried: AtomicBool,
        attempts: Arc<AtomicU32>,
    }

    impl Rule for RetryOnce {
        fn seed_links(&self) -> Vec<String> {
            vec![self.seed.clone()]
        }

        fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.retried.swap(true, Ordering::SeqCst) {
                return Err(ctx.retry());
            }
            ctx.item(json!({ "ok": "yes" }))?;
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let executor = Executor::direct(fast_config(dir.path())).await;
    let attempts = Arc::new(AtomicU32::new(0));
    let task = executor
        .accept(RetryOnce {
            seed: format!("{}/page", server.uri()),
            retried: AtomicBool::new(false),
            attempts: Arc::clone(&attempts),
        })
        .await
        .unwrap();
    wait_for(&task).await;

    // The retry banned the only downloader for this host; completing the
    // command required the fleet clean to install a replacement.
    let counters = task.counters();
    assert_eq!(counters.completed_commands, 1);
    assert_eq!(counters.failed_commands, 0);
    assert_eq!(counters.completed_items, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    executor.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_under_load() {
    struct SeedOnly {
        seeds: Vec<String>,
    }

    impl Rule for SeedOnly {
        fn seed_links(&self) -> Vec<String> {
            self.seeds.clone()
        }

        fn parse(&self, _ctx: &mut Context<'_>) -> ParseResult<()> {
            Ok(())
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html></html>")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let executor = Executor::direct(fast_config(dir.path())).await;

    let seeds = (0..200).map(|i| format!("{}/{i}", server.uri())).collect();
    let task = executor.accept(SeedOnly { seeds }).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stop_started = Instant::now();
    executor.stop().await;
    let stop_elapsed = stop_started.elapsed();

    assert!(
        stop_elapsed < Duration::from_secs(10),
        "stop took too long: {stop_elapsed:?}"
    );
    assert!(!executor.is_running());

    // Whatever was in flight is accounted for as completed, failed or
    // still-running-at-shutdown; nothing panicked and totals still add up.
    let counters = task.counters();
    assert_eq!(counters.total_commands(), 200);

    struct Noop;
    impl Rule for Noop {
        fn seed_links(&self) -> Vec<String> {
            Vec::new()
        }
        fn parse(&self, _ctx: &mut Context<'_>) -> ParseResult<()> {
            Ok(())
        }
    }
    assert!(executor.accept(Noop).await.is_none());
}

#[tokio::test]
async fn save_resource_writes_under_the_task_folder() {
    struct SaveRule {
        seed: String,
    }

    impl Rule for SaveRule {
        fn seed_links(&self) -> Vec<String> {
            vec![self.seed.clone()]
        }

        fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
            ctx.save_resource("/asset.bin", "assets/asset.bin")
        }

        fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
            Vec::new()
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/asset.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BLOB".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let executor = Executor::direct(fast_config(dir.path())).await;
    let task = executor
        .accept(SaveRule {
            seed: format!("{}/page", server.uri()),
        })
        .await
        .unwrap();
    wait_for(&task).await;

    assert_eq!(task.counters().completed_commands, 2);
    let saved = task.folder_path().join("assets/asset.bin");
    assert_eq!(std::fs::read(&saved).unwrap(), b"BLOB");

    executor.stop().await;
}
