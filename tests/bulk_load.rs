//! Client bulk loads: chunking, bisection of rejected chunks, reject files
//! and resuming after the error budget runs out.

use anyhow::Result;
use ironload::LoadError;
use ironload::chunk_retry::{BulkLoadOptions, BulkLoader};
use ironload::config::CopyFormat;
use ironload::io::create_output;
use ironload::metrics::MetricsCollector;
use ironload::testing::ScriptedSubmitter;
use std::fs;
use std::io::{Cursor, Write};
use tempfile::tempdir;

fn numbered(n: usize, bad: &[usize]) -> String {
    (1..=n)
        .map(|i| {
            if bad.contains(&i) {
                format!("bad{i}|x\n")
            } else {
                format!("{i}|x\n")
            }
        })
        .collect()
}

fn options(chunk: usize) -> BulkLoadOptions {
    BulkLoadOptions {
        commit_interval: chunk,
        ..BulkLoadOptions::new("items", CopyFormat::text('|'))
    }
}

#[test]
fn rejects_land_in_the_reject_file() -> Result<()> {
    let dir = tempdir()?;
    let rejects = dir.path().join("out").join("rejects.txt");
    let opts = BulkLoadOptions {
        reject_file: Some(rejects.clone()),
        ..options(10)
    };
    let mut loader = BulkLoader::new(opts, ScriptedSubmitter::rejecting_prefix("bad"))?;
    let summary = loader.run(Cursor::new(numbered(25, &[3, 17])))?;

    assert_eq!(summary.rows_read, 25);
    assert_eq!(summary.rows_loaded, 23);
    assert_eq!(summary.rejected_rows, 2);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.first_error.as_deref(), Some("bad row: bad3|x"));
    assert_eq!(
        fs::read_to_string(&rejects)?,
        "# bad row: bad3|x\nbad3|x\n# bad row: bad17|x\nbad17|x\n"
    );
    assert_eq!(loader.submitter().accepted_rows(), 23);
    Ok(())
}

#[test]
fn budget_stops_the_load_and_a_resume_finishes_it() -> Result<()> {
    let input = numbered(30, &[5, 12, 13]);
    let opts = BulkLoadOptions {
        max_errors: Some(2),
        ..options(10)
    };

    let mut first = BulkLoader::new(opts.clone(), ScriptedSubmitter::rejecting_prefix("bad"))?;
    let err = first.run(Cursor::new(input.clone())).unwrap_err();
    let LoadError::ErrorBudgetExceeded {
        lines_consumed,
        rejected_rows,
    } = err
    else {
        panic!("unexpected error: {err}");
    };
    assert_eq!((lines_consumed, rejected_rows), (13, 3));
    assert_eq!(first.summary().rows_loaded, 10);

    let resumed = BulkLoadOptions {
        start_line: lines_consumed + 1,
        ..opts
    };
    let mut second = BulkLoader::new(resumed, ScriptedSubmitter::rejecting_prefix("bad"))?;
    let summary = second.run(Cursor::new(input))?;
    assert_eq!(summary.rows_loaded, 17);
    assert_eq!(summary.rejected_rows, 0);

    let mut all = first.submitter().accepted();
    all.extend(second.submitter().accepted());
    assert_eq!(all.len(), 27);
    assert_eq!(all.first().map(String::as_str), Some("1|x"));
    assert_eq!(all.last().map(String::as_str), Some("30|x"));
    Ok(())
}

#[test]
fn compressed_inputs_and_metrics() -> Result<()> {
    let dir = tempdir()?;
    let mut gz = create_output(dir.path().join("items-a.txt.gz"))?;
    gz.write_all(numbered(8, &[2]).as_bytes())?;
    gz.flush()?;
    drop(gz);
    fs::write(dir.path().join("items-b.txt"), "9|x\n10|x\n")?;

    let metrics = MetricsCollector::new();
    let mut loader = BulkLoader::new(options(4), ScriptedSubmitter::rejecting_prefix("bad"))?
        .with_metrics(metrics.clone());
    let pattern = dir.path().join("items-*").to_string_lossy().into_owned();
    let summary = loader.run_inputs(&[pattern])?;

    assert_eq!(summary.lines_read, 10);
    assert_eq!(summary.rows_loaded, 9);
    assert_eq!(metrics.counter("rows_loaded"), Some(9));
    assert_eq!(metrics.counter("rows_rejected"), Some(1));
    assert_eq!(metrics.counter("chunks"), Some(3));
    assert_eq!(loader.submitter().accepted().last().map(String::as_str), Some("10|x"));
    Ok(())
}

#[test]
fn options_load_from_json() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bulk.json");
    fs::write(
        &path,
        r#"{ "table": "items", "columns": ["id", "name"],
             "format": { "delimiter": ",", "csv": { "quote": "\"", "escape": "\"" } },
             "commit_interval": 50, "max_errors": 10 }"#,
    )?;
    let opts = BulkLoadOptions::from_json_file(&path)?;
    assert_eq!(opts.commit_interval, 50);
    assert_eq!(opts.auto_reduce_rate, 10);
    assert!(opts.format.is_csv());
    assert!(!opts.output_format().is_csv());

    fs::write(&path, r#"{ "table": "items", "commit_interval": 0 }"#)?;
    assert!(BulkLoadOptions::from_json_file(&path).is_err());
    Ok(())
}

#[cfg(unix)]
mod process_sink {
    use super::*;
    use ironload::NodeId;
    use ironload::chunk_retry::WriterSubmitter;
    use ironload::writers::{
        CommandTemplate, NodeConnectionInfo, ProcessWriterConfig, ProcessWriterFactory,
    };
    use std::sync::Arc;

    /// A sink that fails any chunk containing `bad` and appends the rest to
    /// `table.out`.
    fn sink_config(dir: &std::path::Path) -> ProcessWriterConfig {
        let out = dir.join("table.out");
        let staged = dir.join("chunk.tmp");
        let script = format!(
            "cat > '{staged}'; if grep -q bad '{staged}'; then echo 'invalid input syntax' >&2; exit 3; fi; cat '{staged}' >> '{out}'",
            staged = staged.display(),
            out = out.display(),
        );
        ProcessWriterConfig {
            command: CommandTemplate::new("sh", ["-c".to_string(), script]),
            grace_period_ms: 5_000,
            nodes: vec![NodeConnectionInfo {
                node: NodeId::new(1),
                host: "localhost".into(),
                port: 5432,
                database: "db".into(),
                user: "loader".into(),
                password: None,
            }],
            ..ProcessWriterConfig::default()
        }
    }

    #[test]
    fn failing_chunks_are_bisected_against_a_real_process() -> Result<()> {
        let dir = tempdir()?;
        let opts = options(6);
        let submitter = WriterSubmitter::new(
            Arc::new(ProcessWriterFactory::new(sink_config(dir.path()))?),
            NodeId::new(1),
            opts.sink_target(),
        );
        let mut loader = BulkLoader::new(opts, submitter)?;
        let summary = loader.run(Cursor::new(numbered(12, &[4])))?;

        assert_eq!(summary.rows_loaded, 11);
        assert_eq!(summary.rejected_rows, 1);
        assert!(
            summary
                .first_error
                .as_deref()
                .is_some_and(|e| e.contains("invalid input syntax")),
            "{:?}",
            summary.first_error
        );
        let loaded = fs::read_to_string(dir.path().join("table.out"))?;
        assert_eq!(loaded.lines().count(), 11);
        assert!(!loaded.contains("bad"));
        Ok(())
    }
}
