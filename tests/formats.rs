//! Input formats and routing modes through the whole load path.

use anyhow::Result;
use ironload::config::{CopyFormat, LoadConfig, Partitioning};
use ironload::io::create_output;
use ironload::orchestrator::{LoadOrchestrator, WorkerPool};
use ironload::readers::RawStreamReader;
use ironload::routing::{HashPartitionMap, PartitionMap, StaticPartitionMap};
use ironload::row::{ColumnDescriptor, ColumnType, TableLayout};
use ironload::testing::*;
use ironload::writers::MemoryWriterFactory;
use std::io::{Cursor, Write};
use std::sync::Arc;
use tempfile::tempdir;

fn notes(format: CopyFormat, partitioning: Partitioning) -> LoadConfig {
    LoadConfig::new(
        TableLayout::new(
            "notes",
            vec![
                ColumnDescriptor::new("id").with_type(ColumnType::Integer),
                ColumnDescriptor::new("body"),
            ],
        ),
        format,
        partitioning,
    )
    .with_processors(2)
    .with_buffer_capacity(8)
}

fn by_id(format: CopyFormat) -> LoadConfig {
    notes(format, Partitioning::Column { name: "id".into() })
}

fn id_map() -> Arc<dyn PartitionMap> {
    Arc::new(
        StaticPartitionMap::new([NODE1, NODE2])
            .assign(["1", "3"], NODE1)
            .assign(["2"], NODE2),
    )
}

#[test]
fn csv_records_keep_quoting_and_line_breaks() -> Result<()> {
    let config = by_id(CopyFormat::csv(','));
    let reader = RawStreamReader::new(Cursor::new(
        "1,\"hello, world\"\n2,\"two\nlines\"\r\n3,\n",
    ))
    .for_format(&config.format);

    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    let report = LoadOrchestrator::new(&pool, config, id_map(), factory.clone())?.run(reader)?;

    // CSV loads run on one processor whatever the configuration says.
    assert_eq!(factory.record(NODE1).writers, 1);
    assert_eq!(report.rows_loaded, 3);
    assert_committed(&factory, NODE1, &["1,\"hello, world\"", "3,"]);
    assert_committed(&factory, NODE2, &["2,\"two\nlines\""]);
    Ok(())
}

#[test]
fn text_escapes_pass_through_untouched() -> Result<()> {
    let config = by_id(CopyFormat::text('\t'));
    let reader = RawStreamReader::new(Cursor::new("1\ta\\tb\n2\t\\N\n"));
    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    LoadOrchestrator::new(&pool, config, id_map(), factory.clone())?.run(reader)?;
    assert_committed(&factory, NODE1, &["1\ta\\tb"]);
    assert_committed(&factory, NODE2, &["2\t\\N"]);
    Ok(())
}

#[test]
fn explicit_node_column_is_removed_before_writing() -> Result<()> {
    let config = notes(CopyFormat::text('|'), Partitioning::ExplicitNode);
    let reader = RawStreamReader::new(Cursor::new("1|a|2\n2|b|1\n3|c|2\n"));
    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    LoadOrchestrator::new(&pool, config, id_map(), factory.clone())?.run(reader)?;
    assert_committed(&factory, NODE1, &["2|b"]);
    assert_committed(&factory, NODE2, &["1|a", "3|c"]);
    Ok(())
}

#[test]
fn explicit_node_outside_the_map_fails() -> Result<()> {
    let config = notes(CopyFormat::text('|'), Partitioning::ExplicitNode);
    let reader = RawStreamReader::new(Cursor::new("1|a|9\n"));
    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    let err = LoadOrchestrator::new(&pool, config, id_map(), factory.clone())?
        .run(reader)
        .unwrap_err();
    assert!(err.to_string().contains("node9"), "{err}");
    assert_rolled_back(&factory, &[NODE1, NODE2]);
    Ok(())
}

#[test]
fn replicated_tables_get_every_row_on_every_node() -> Result<()> {
    let config = notes(CopyFormat::text('|'), Partitioning::Replicated);
    let map: Arc<dyn PartitionMap> = Arc::new(HashPartitionMap::new(vec![NODE1, NODE2])?.replicated());
    let reader = RawStreamReader::new(Cursor::new("1|a\n2|b\n"));
    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    let report = LoadOrchestrator::new(&pool, config, map, factory.clone())?.run(reader)?;

    assert_eq!(report.rows_loaded, 2);
    assert_eq!(report.rows_per_node[&NODE1], 2);
    assert_eq!(report.rows_per_node[&NODE2], 2);
    assert_committed(&factory, NODE1, &["1|a", "2|b"]);
    assert_committed(&factory, NODE2, &["1|a", "2|b"]);
    Ok(())
}

#[test]
fn hash_partitioning_is_stable_across_loads() -> Result<()> {
    let map: Arc<dyn PartitionMap> = Arc::new(HashPartitionMap::new(vec![NODE1, NODE2])?);
    let input: String = (0..200).map(|i| format!("{i}|v{i}\n")).collect();
    let pool = WorkerPool::for_processors(2)?;

    let mut placements = Vec::new();
    for _ in 0..2 {
        let factory = Arc::new(MemoryWriterFactory::new());
        LoadOrchestrator::new(
            &pool,
            by_id(CopyFormat::text('|')),
            Arc::clone(&map),
            factory.clone(),
        )?
        .run(RawStreamReader::new(Cursor::new(input.clone())))?;
        placements.push(factory.committed_sorted());
    }
    assert_eq!(placements[0], placements[1]);
    assert_eq!(placements[0].values().map(Vec::len).sum::<usize>(), 200);
    Ok(())
}

#[test]
fn compressed_and_globbed_inputs_load_in_name_order() -> Result<()> {
    let dir = tempdir()?;
    let mut first = create_output(dir.path().join("part-1.txt.gz"))?;
    first.write_all(b"1|gz\n")?;
    first.flush()?;
    drop(first);
    std::fs::write(dir.path().join("part-2.txt"), "2|plain\n3|plain\n")?;

    let pattern = dir.path().join("part-*").to_string_lossy().into_owned();
    let reader = RawStreamReader::open(&[pattern])?;
    let pool = WorkerPool::for_processors(1)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    let report = LoadOrchestrator::new(
        &pool,
        by_id(CopyFormat::text('|')).with_processors(1),
        id_map(),
        factory.clone(),
    )?
    .run(reader)?;

    assert_eq!(report.rows_loaded, 3);
    assert_eq!(factory.record(NODE1).committed_strings(), vec!["1|gz", "3|plain"]);
    assert_committed(&factory, NODE2, &["2|plain"]);
    Ok(())
}
