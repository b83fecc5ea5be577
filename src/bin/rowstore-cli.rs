//! RowStore 命令行工具
//!
//! Inspect tables, commit records and keystones, and run one compaction on a
//! store directory. Set `RUST_LOG=debug` for engine logs.

use anyhow::{bail, Context};
use rowstore::storage::{FileKeystone, Keystone};
use rowstore::{
    CommitRecord, DeleteCodec, Direction, MergePolicy, RowLayout, RowOrder, SortedTable,
    StoreConfig, TableStore, TieredMergePolicy,
};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut args: Vec<&str> = args.iter().map(String::as_str).collect();

    // --delete may appear anywhere
    let codec = match args.iter().position(|a| *a == "--delete") {
        Some(i) => {
            let spec = args.get(i + 1).copied().context("--delete needs a codec")?;
            args.remove(i + 1);
            args.remove(i);
            Some(DeleteCodec::parse(spec)?)
        }
        None => None,
    };
    let layout = |width: &str, order: &str| parse_layout(width, order, codec.clone());

    match args.as_slice() {
        [] | ["--help"] | ["-h"] => print_help(),
        ["--version"] | ["-v"] => println!("rowstore-cli v{}", VERSION),
        ["info", table, width, order] => info(table, layout(width, order)?)?,
        ["dump", table, width, order] => dump(table, layout(width, order)?, None)?,
        ["dump", table, width, order, limit] => {
            let limit = limit.parse().with_context(|| format!("bad limit '{}'", limit))?;
            dump(table, layout(width, order)?, Some(limit))?
        }
        ["commit", file] => commit(file)?,
        ["keystone", file] => keystone(file)?,
        ["compact", dir, width, order] => compact(dir, layout(width, order)?, None)?,
        ["compact", dir, width, order, config] => {
            compact(dir, layout(width, order)?, Some(Path::new(config)))?
        }
        _ => {
            print_help();
            bail!("invalid arguments");
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"
rowstore-cli v{} - 有序表存储工具

用法:
  rowstore-cli info <table> <width> <order>            行数与大小
  rowstore-cli dump <table> <width> <order> [limit]    十六进制输出行
  rowstore-cli commit <COMMIT file>                    列出提交的表 id
  rowstore-cli keystone <KEYSTONE file>                读取 keystone 值
  rowstore-cli compact <dir> <width> <order> [config]  执行一次分层合并

选项:
  --delete <codec>    墓碑编码 (info / dump / compact)

排序格式:
  int:OFF  long:OFF  short:OFF  bytes:OFF:LEN   (逗号分隔 = 复合键)

墓碑格式:
  flag:OFF  magic:OFF:VALUE

示例:
  rowstore-cli info data/table-3.rows 16 long:0
  rowstore-cli dump data/table-3.rows 16 int:0,bytes:4:8 20
  rowstore-cli compact data 16 long:0 --delete flag:15
"#,
        VERSION
    );
}

fn parse_layout(width: &str, order: &str, codec: Option<DeleteCodec>) -> anyhow::Result<RowLayout> {
    let width: usize = width
        .parse()
        .with_context(|| format!("bad row width '{}'", width))?;
    let order = RowOrder::parse(order)?;
    let layout = RowLayout::new(width, order)?;
    Ok(match codec {
        Some(codec) => layout.with_delete_codec(codec)?,
        None => layout,
    })
}

fn info(path: &str, layout: RowLayout) -> anyhow::Result<()> {
    let table = SortedTable::open(path, layout)
        .with_context(|| format!("opening table {}", path))?;
    println!("📊 {}", path);
    println!("  rows:   {}", table.row_count());
    println!("  width:  {}", table.row_width());
    println!("  order:  {}", table.layout().order());
    if let Some(codec) = table.layout().delete_codec() {
        let mut deleted = 0u64;
        for row in table.iter() {
            if codec.is_deleted(&row?) {
                deleted += 1;
            }
        }
        println!("  delete: {} ({} tombstones)", codec, deleted);
    }
    println!("  bytes:  {}", table.byte_size());
    Ok(())
}

fn dump(path: &str, layout: RowLayout, limit: Option<u64>) -> anyhow::Result<()> {
    let table = SortedTable::open(path, layout)
        .with_context(|| format!("opening table {}", path))?;
    let limit = limit.unwrap_or(u64::MAX);
    for (i, row) in table.iter().enumerate().take(limit.min(usize::MAX as u64) as usize) {
        let row = row?;
        let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        let mark = match table.layout().delete_codec() {
            Some(codec) if codec.is_deleted(&row) => " ✗",
            _ => "",
        };
        match table.layout().order().read_key(&row) {
            Some(key) => println!("{:>8}{} key={:<20} {}", i, mark, key, hex.join(" ")),
            None => println!("{:>8}{} {}", i, mark, hex.join(" ")),
        }
    }
    Ok(())
}

fn commit(path: &str) -> anyhow::Result<()> {
    let ids = CommitRecord::new(path).load()?;
    if ids.is_empty() {
        println!("(empty)");
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

fn keystone(path: &str) -> anyhow::Result<()> {
    let ks = FileKeystone::open_file(path).with_context(|| format!("opening keystone {}", path))?;
    println!("value:      {}", ks.get()?);
    println!("generation: {}", ks.generation());
    Ok(())
}

fn compact(dir: &str, layout: RowLayout, config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => StoreConfig::load_json(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let policy = TieredMergePolicy::from(&config.merge);
    let mut store = TableStore::open(dir, layout, config)?;

    let before = store.table_ids();
    println!("🔍 tables before: {:?}", before);
    match policy.select(&store.table_infos()) {
        None => println!("✓ nothing to merge"),
        Some(range) => {
            let stats = store.compact_range(range.clone())?;
            println!("✓ merged {:?} -> {:?}", &before[range], store.table_ids());
            println!(
                "  rows {} -> {} ({} overridden, {} tombstones purged, {} kept) in {} ms",
                stats.rows_read,
                stats.rows_written,
                stats.rows_overridden,
                stats.tombstones_purged,
                stats.tombstones_kept,
                stats.elapsed_ms
            );
        }
    }

    let set = store.table_set()?;
    if let Some(first) = set.reader().first_row(Direction::Ascending)? {
        if let Some(key) = store.layout().order().read_key(&first) {
            println!("  first key: {}", key);
        }
    }
    Ok(())
}
