use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nppes_ingest::prelude::*;
use std::hint::black_box;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

const ROWS: usize = 200_000;

// Synthetic extract shared by all benchmarks
static SOURCE: OnceLock<(TempDir, PathBuf)> = OnceLock::new();

fn source() -> &'static Path {
    let (_, path) = SOURCE.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("npidata_pfile_20050523-20250511.csv");
        let mut out = std::io::BufWriter::new(std::fs::File::create(&path).unwrap());

        let mut header = vec![
            "NPI".to_string(),
            "Provider Organization Name (Legal Business Name)".to_string(),
        ];
        header.extend(NppesColumns::slot_columns("Healthcare Provider Taxonomy Code"));
        writeln!(out, "{}", header.join(",")).unwrap();

        for i in 0..ROWS {
            let mut codes = vec![""; 15];
            codes[0] = "207Q00000X";
            if i % 50 == 0 {
                codes[i % 15] = "324500000X";
            }
            writeln!(out, "{},Org {},{}", 1_000_000_000 + i, i % 1000, codes.join(",")).unwrap();
        }
        out.flush().unwrap();
        (dir, path)
    });
    path
}

fn benchmark_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ROWS as u64));

    let path = source();
    for threads in [1usize, 4] {
        for chunk_size in [10_000usize, 100_000] {
            let config = ConfigBuilder::new()
                .chunk_size(chunk_size)
                .parallel_threads(Some(threads))
                .progress_bar(false)
                .build()
                .unwrap();
            let filter = ChunkedFilter::new(&config.filter).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("threads_{}", threads), chunk_size),
                &filter,
                |b, filter| {
                    b.iter(|| {
                        let (rows, _) = filter.filter(black_box(path)).unwrap().collect_rows().unwrap();
                        rows.len()
                    })
                },
            );
        }
    }
    group.finish();
}

fn benchmark_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");

    let header = Arc::new(Header::new(["NPI", "Name", "Code"]));
    // Every row appears twice
    let rows: Vec<RawRow> = (0..20_000)
        .map(|i| {
            RawRow::new(
                header.clone(),
                vec![(1_000_000_000 + i / 2).to_string(), format!("Org {}", i / 2), "324500000X".to_string()],
            )
        })
        .collect();

    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("dedup_20k_half_duplicates", |b| {
        b.iter(|| dedup(black_box(rows.clone())).len())
    });
    group.finish();
}

fn benchmark_mapper(c: &mut Criterion) {
    let header = Arc::new(Header::new([
        "NPI",
        "Provider Organization Name (Legal Business Name)",
        "Healthcare Provider Taxonomy Code_1",
        "Healthcare Provider Primary Taxonomy Switch_1",
        "Last Update Date",
    ]));
    let row = RawRow::new(
        header,
        vec![
            "1234567893".to_string(),
            "Hope Recovery Center".to_string(),
            "324500000X".to_string(),
            "Y".to_string(),
            "07/08/2024".to_string(),
        ],
    );
    let mapper = RecordMapper::new();

    c.bench_function("map_row", |b| b.iter(|| mapper.map_row(black_box(&row)).unwrap()));
}

criterion_group!(benches, benchmark_filter, benchmark_dedup, benchmark_mapper);
criterion_main!(benches);
