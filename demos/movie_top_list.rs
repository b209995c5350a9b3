//! Scrapes a movie top-list site: every list page is followed to its
//! detail pages, each of which yields one item and a saved cover image.
//!
//! Run with a site of your own (the selectors below assume a common
//! top-250-style layout):
//!
//! ```sh
//! cargo run --example movie_top_list -- https://movies.example/top
//! ```

use std::sync::Arc;

use serde::Serialize;

use spinneret::{
    Context, Executor, ExecutorConfig, JsonFilePipeline, JsonStdoutPipeline, ParseResult,
    Pipeline, Rule,
};

#[derive(Serialize)]
struct MovieItem {
    title: String,
    year: String,
    pic_link: String,
    rank: String,
}

struct MovieTopList {
    base: String,
}

impl Rule for MovieTopList {
    fn seed_links(&self) -> Vec<String> {
        (0..10)
            .map(|page| format!("{}?start={}", self.base, page * 25))
            .collect()
    }

    fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
        ctx.html("ol.grid_view > li", |ctx, entry| {
            let rank = entry.child_text("div.pic em")?;
            let title = entry.child_text("span.title")?;
            let detail_link = entry.child_attr("div.pic a", "href")?;
            ctx.follow_with_data(
                &detail_link,
                scrape_detail,
                [
                    ("rank".to_string(), serde_json::json!(rank)),
                    ("title".to_string(), serde_json::json!(title)),
                ],
            )
        })?;
        Ok(())
    }

    fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
        vec![
            Arc::new(JsonFilePipeline::in_task_folder()),
            Arc::new(JsonStdoutPipeline::new()),
        ]
    }
}

fn scrape_detail(ctx: &mut Context<'_>) -> ParseResult<()> {
    let title = ctx
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let rank = ctx
        .get("rank")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    ctx.html("", |ctx, page| {
        let pic_link = page.child_attr("#mainpic a img", "src")?;
        let year = page.child_text("#content h1 span.year")?;
        ctx.save_resource(&pic_link, &format!("{rank}.{year}.{title}.cover.jpg"))?;
        ctx.item(MovieItem {
            title: title.clone(),
            year,
            pic_link,
            rank: rank.clone(),
        })
    })?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let base = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://movies.example/top".to_string());

    let executor = Executor::direct(ExecutorConfig::direct()).await;
    if let Some(task) = executor.accept(MovieTopList { base }).await {
        task.wait().await;
        println!("{:?}", task.counters());
    }
    executor.stop().await;
}
