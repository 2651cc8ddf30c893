use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use mockable::DefaultClock;
use serde::Serialize;

use rollcall::cache::{CacheResult, Collection, DateWindow};
use rollcall::config::Config;
use rollcall::db::Database;
use rollcall::jobs::{ReportKind, ReportParameters};
use rollcall::remote::HttpRemote;
use rollcall::school::types::{
  AttendanceScope, AttendanceStatus, AttendanceSubmission, AttendanceSummary, CalendarEvent,
  Classroom, Student,
};
use rollcall::{logging, OfflineClient};

#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(about = "Offline-first attendance client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rollcall/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Bring a collection up to date and print it
  Sync { collection: Collection },
  /// Print the records of a collection overlapping a date range
  Window {
    collection: Collection,
    #[arg(long)]
    from: NaiveDate,
    #[arg(long)]
    to: NaiveDate,
  },
  /// Query one classroom's monthly attendance, subject to the cooldown
  Governor { classroom: u64, year: i32, month: u32 },
  /// Record attendance for delivery
  Enqueue {
    classroom: u64,
    student: u64,
    date: NaiveDate,
    status: AttendanceStatus,
  },
  /// Inspect or flush the write queue
  Queue {
    #[command(subcommand)]
    action: QueueCommand,
  },
  /// Generate attendance reports
  Report {
    #[command(subcommand)]
    action: ReportCommand,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  Stats,
  Drain,
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
  Create(ReportArgs),
  Poll(ReportArgs),
  Estimate(ReportArgs),
}

#[derive(ClapArgs, Debug)]
struct ReportArgs {
  #[arg(long)]
  from: NaiveDate,
  #[arg(long)]
  to: NaiveDate,
  /// One column per school day instead of monthly totals
  #[arg(long)]
  daily: bool,
  /// Restrict to these classrooms (default: all)
  #[arg(long = "classroom")]
  classrooms: Vec<u64>,
}

impl ReportArgs {
  fn parameters(&self) -> ReportParameters {
    let kind = if self.daily {
      ReportKind::Daily
    } else {
      ReportKind::Monthly
    };
    ReportParameters::new(kind, self.from, self.to, self.classrooms.clone())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_dir = logging::default_dir().ok_or_else(|| eyre!("Could not determine a data directory"))?;
  let _guard = logging::init(&log_dir)?;

  let db = Database::open(&config.store_path()?)?;
  let remote = Arc::new(HttpRemote::new(&config.remote, Config::get_api_token())?);
  let client = OfflineClient::new(db, remote, Arc::new(DefaultClock), &config)?;

  run(&client, args.command).await?;

  client.close().await?;
  Ok(())
}

async fn run(client: &OfflineClient<HttpRemote>, command: Command) -> Result<()> {
  match command {
    Command::Sync { collection } => match collection {
      Collection::Events => print_result(client.ensure_fresh_and_get::<CalendarEvent>().await?),
      Collection::Classrooms => print_result(client.ensure_fresh_and_get::<Classroom>().await?),
      Collection::Students => print_result(client.ensure_fresh_and_get::<Student>().await?),
      Collection::Attendance => {
        print_result(client.ensure_fresh_and_get::<AttendanceSummary>().await?)
      }
    },

    Command::Window {
      collection,
      from,
      to,
    } => {
      if collection != Collection::Events {
        return Err(eyre!("{} records carry no date range", collection));
      }
      let window = DateWindow::new(from.min(to), to.max(from));
      print_result(client.ensure_fresh_window::<CalendarEvent>(window).await?)
    }

    Command::Governor {
      classroom,
      year,
      month,
    } => {
      let scope = AttendanceScope::new(classroom, year, month);
      let scoped = client.query_attendance(&scope).await?;
      if !scoped.permit.allowed {
        println!(
          "{} was queried recently, showing cached data (retry in {} min)",
          scope, scoped.permit.wait_minutes
        );
      }
      print_result(scoped.result)
    }

    Command::Enqueue {
      classroom,
      student,
      date,
      status,
    } => {
      let order = client.enqueue_write(&AttendanceSubmission {
        classroom_id: classroom,
        student_id: student,
        date,
        status,
        recorded_at: Utc::now().timestamp_millis(),
      })?;
      println!("queued as #{}", order);
      Ok(())
    }

    Command::Queue { action } => match action {
      QueueCommand::Stats => {
        let stats = client.queue_stats()?;
        println!("{} pending", stats.count);
        for item in client.pending_writes()? {
          println!(
            "#{} {} {} attempts={}{}",
            item.order_number,
            item.kind,
            item.correlation.as_deref().unwrap_or("-"),
            item.attempts,
            item
              .last_error
              .map(|e| format!(" last_error={}", e))
              .unwrap_or_default()
          );
        }
        Ok(())
      }
      QueueCommand::Drain => {
        let report = client.drain_queue().await?;
        println!(
          "delivered {}, deferred {}, {} still pending",
          report.delivered,
          report.deferred,
          client.queue_stats()?.count
        );
        Ok(())
      }
    },

    Command::Report { action } => match action {
      ReportCommand::Create(args) => {
        let record = client.create_job(&args.parameters()).await?;
        println!("{} {}", record.parameter_key, record.status);
        Ok(())
      }
      ReportCommand::Poll(args) => {
        let params = args.parameters();
        let estimate = client.estimate_duration(&params);
        println!("waiting, {}", estimate.description);
        let record = client
          .poll_job(&params, |record, elapsed| {
            println!("[{:>4}s] {}", elapsed, record.status);
          })
          .await?;
        if let Some(payload) = record.result_payload {
          println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Ok(())
      }
      ReportCommand::Estimate(args) => {
        let params = args.parameters();
        let estimate = client.estimate_duration(&params);
        println!("{} (at least {}s)", estimate.description, estimate.min_seconds);
        Ok(())
      }
    },
  }
}

fn print_result<T: Serialize>(result: CacheResult<Vec<T>>) -> Result<()> {
  println!(
    "{} records ({:?}{})",
    result.data.len(),
    result.source,
    result
      .cached_at
      .and_then(rollcall::clock::from_millis)
      .map(|t| format!(", cached {}", t.format("%Y-%m-%d %H:%M")))
      .unwrap_or_default()
  );
  for item in &result.data {
    println!("{}", serde_json::to_string(item)?);
  }
  Ok(())
}
