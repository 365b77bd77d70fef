use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

use drivecrawl::config::Config;
use drivecrawl::crawler::SearchProgress;
use drivecrawl::drive::FolderConfig;
use drivecrawl::logging;
use drivecrawl::preloader::{PageKind, PreloadOutcome};
use drivecrawl::session::Session;

#[derive(Parser, Debug)]
#[command(name = "drivecrawl")]
#[command(about = "Cached, rate-limited search over public Google Drive folders")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./drivecrawl.yaml or $XDG_CONFIG_HOME/drivecrawl/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep the cache in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Also write logs to a daily rolling file in this directory
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the direct children of a folder
  List {
    folder_id: String,
    #[arg(short, long)]
    scope: Option<String>,
    #[arg(short, long, default_value_t = 0)]
    depth: u32,
    /// Bypass the cache entirely
    #[arg(long)]
    no_cache: bool,
    /// Fetch fresh and overwrite the cached listing
    #[arg(long, conflicts_with = "no_cache")]
    refresh: bool,
  },
  /// Search documents by name under the mapped folders
  Search {
    term: String,
    /// Only search this semester of the mapping
    #[arg(long)]
    semester: Option<String>,
    /// Search these folder ids instead of the mapping
    #[arg(long = "root")]
    roots: Vec<String>,
    #[arg(short, long)]
    scope: Option<String>,
    #[arg(short = 'd', long)]
    max_depth: Option<u32>,
    /// Print results as JSON
    #[arg(long)]
    json: bool,
  },
  /// Re-fetch a folder tree and overwrite its cached listings
  Rebuild {
    folder_id: String,
    #[arg(short, long)]
    scope: Option<String>,
    #[arg(short = 'd', long)]
    max_depth: Option<u32>,
  },
  /// Warm the cache for every mapped folder
  Preload {
    /// Page the run is scheduled from; decides the start delay
    #[arg(long, value_enum, default_value_t = Page::Landing)]
    page: Page,
    /// Start now, even if the cache is fresh
    #[arg(long)]
    force: bool,
  },
  /// Show cache, limiter and preload statistics
  Stats {
    #[arg(short, long)]
    scope: Option<String>,
  },
  /// Clear cached listings
  Clear {
    #[arg(short, long, conflicts_with = "all")]
    scope: Option<String>,
    /// Clear every scope and sweep all cache records
    #[arg(long)]
    all: bool,
  },
  /// Remove expired entries from a scope
  Clean {
    #[arg(short, long)]
    scope: Option<String>,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Page {
  Landing,
  Other,
}

impl From<Page> for PageKind {
  fn from(page: Page) -> Self {
    match page {
      Page::Landing => PageKind::Landing,
      Page::Other => PageKind::Other,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let session = Session::open(config, args.ephemeral)?;

  run(session, args.command).await
}

async fn run(session: Session, command: Command) -> Result<()> {
  let default_scope = session.config.search.scope.clone();

  match command {
    Command::List {
      folder_id,
      scope,
      depth,
      no_cache,
      refresh,
    } => {
      let scope = scope.unwrap_or(default_scope);
      let client = session.crawler()?.client();
      let files = if refresh {
        client.refresh_children(&folder_id, &scope, depth).await
      } else {
        client.list_children(&folder_id, &scope, depth, !no_cache).await
      };

      for file in files {
        let kind = if file.is_folder() { "dir" } else { "file" };
        println!("{}\t{}\t{}\t{}", kind, file.id, file.name, file.view_link);
      }
    }

    Command::Search {
      term,
      semester,
      roots,
      scope,
      max_depth,
      json,
    } => {
      let roots = if roots.is_empty() {
        session
          .mapping
          .try_load()
          .await?
          .folder_configs(semester.as_deref())
      } else {
        roots
          .into_iter()
          .map(|id| FolderConfig {
            folder_id: id.clone(),
            semester: semester.clone().unwrap_or_default(),
            batch_label: id,
          })
          .collect()
      };
      if roots.is_empty() {
        return Err(eyre!("No folders to search"));
      }

      let scope = scope.unwrap_or(default_scope);
      let max_depth = max_depth.unwrap_or(session.config.search.max_depth);

      let crawler = session.crawler()?;
      let (tx, mut rx) = mpsc::unbounded_channel::<SearchProgress>();
      let reporter = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
          eprintln!(
            "[{}/{}] {} results, {} active, {} queued",
            p.completed_folders, p.total_folders, p.results, p.active, p.queued
          );
        }
      });

      let results = crawler
        .search(&roots, &term, max_depth, &scope, Some(&tx))
        .await;
      drop(tx);
      let _ = reporter.await;

      if json {
        println!(
          "{}",
          serde_json::to_string_pretty(&results)
            .map_err(|e| eyre!("Failed to serialize results: {}", e))?
        );
      } else {
        for r in &results {
          println!("{}\t{}/{}\t{}\t{}", r.name, r.semester, r.batch, r.path, r.link);
        }
        eprintln!("{} results", results.len());
      }
    }

    Command::Rebuild {
      folder_id,
      scope,
      max_depth,
    } => {
      let scope = scope.unwrap_or(default_scope);
      let max_depth = max_depth.unwrap_or(session.config.search.max_depth);
      let refreshed = session.crawler()?.rebuild(&folder_id, &scope, max_depth).await;
      println!("Rebuilt {} folder listings", refreshed);
    }

    Command::Preload { page, force } => {
      let preloader = session.preloader()?.clone();
      let task = if force {
        let preloader = preloader.clone();
        tokio::spawn(async move { Some(preloader.start().await) })
      } else {
        preloader.schedule(page.into())
      };

      // First Ctrl-C stops at the next folder boundary, a second one exits
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          eprintln!("Stopping preload (Ctrl-C again to exit)");
          preloader.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
          std::process::exit(130);
        }
      });

      let outcome = task
        .await
        .map_err(|e| eyre!("Preload task failed: {}", e))?;

      match outcome {
        Some(PreloadOutcome::NoMapping) => return Err(eyre!("No drive mapping available")),
        Some(outcome) => println!("{}", outcome),
        None => println!("Cache is fresh; nothing to preload"),
      }
    }

    Command::Stats { scope } => {
      let scope = scope.unwrap_or(default_scope);
      let cache = session.cache.stats(&scope);

      println!("Cache ({}):", scope);
      println!("  keys:    {} ({} valid, {} expired)", cache.total_keys, cache.valid_keys, cache.expired_keys);
      println!("  size:    {} bytes", cache.total_size);

      // Preload progress and limiters exist only with API keys
      if let (Ok(crawler), Ok(preloader)) = (session.crawler(), session.preloader()) {
        let preload = preloader.stats();
        let limiter = crawler.client().limiter().stats();
        println!("Preload ({}):", session.config.preload.scope);
        println!(
          "  folders: {}/{} completed",
          preload.progress.completed.len(),
          preload.progress.total
        );
        println!("  stale:   {}", preloader.needs_preload());
        println!(
          "Limiters: foreground {} max, background {} max",
          limiter.max_concurrent, preload.limiter.max_concurrent
        );
      }
    }

    Command::Clear { scope, all } => {
      let cleared = if all {
        session.cache.clear_all()
      } else {
        session.cache.clear_scope(&scope.unwrap_or(default_scope))
      };
      println!("Cleared {} entries", cleared);
    }

    Command::Clean { scope } => {
      let scope = scope.unwrap_or(default_scope);
      let cleaned = session.cache.clean_expired(&scope);
      println!("Removed {} expired entries", cleaned);
    }
  }

  info!("Done");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::CommandFactory;

  #[test]
  fn test_cli_definition_is_consistent() {
    Args::command().debug_assert();
  }

  #[test]
  fn test_parse_search_and_preload() {
    let args = Args::try_parse_from(["drivecrawl", "--ephemeral", "search", "notes", "--semester", "1ST", "-d", "2"]).unwrap();
    assert!(args.ephemeral);
    assert!(matches!(
      args.command,
      Command::Search { ref term, max_depth: Some(2), .. } if term == "notes"
    ));

    let args = Args::try_parse_from(["drivecrawl", "preload", "--page", "other", "--force"]).unwrap();
    assert!(matches!(
      args.command,
      Command::Preload { page: Page::Other, force: true }
    ));
  }

  #[test]
  fn test_clear_scope_conflicts_with_all() {
    assert!(Args::try_parse_from(["drivecrawl", "clear", "--all", "--scope", "drive"]).is_err());
  }

  #[tokio::test]
  async fn test_storage_commands_run_without_api_keys() {
    if std::env::var("DRIVECRAWL_API_KEYS").is_ok() {
      return;
    }
    let session = Session::open(Config::default(), true).unwrap();
    session.cache.put("F1", "drive", 0, &[]);

    run(Session::open(Config::default(), true).unwrap(), Command::Stats { scope: None })
      .await
      .unwrap();
    run(session, Command::Clear { scope: None, all: true })
      .await
      .unwrap();
  }
}
