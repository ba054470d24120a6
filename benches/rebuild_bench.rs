//! Full rebuild vs incremental update over a synthetic repository.
//!
//! Run with: cargo bench --bench rebuild_bench

use std::fs;
use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meridian::config::EngineConfig;
use meridian::graph::Span;
use meridian::ingest::{CallRecord, Language, ParseFailure, ParsedFile, SourceParser, SymbolKind, SymbolRecord};
use meridian::pipeline::{GlobalMode, Pipeline};
use tempfile::TempDir;

/// One function per line: `name [callee ...]`.
struct LineParser;

impl SourceParser for LineParser {
    fn parse(&self, path: &str, language: Language, source: &str) -> Result<ParsedFile, ParseFailure> {
        let mut parsed = ParsedFile::new(path, language);
        for (idx, line) in source.lines().enumerate() {
            let mut words = line.split_whitespace();
            let Some(name) = words.next() else { continue };
            let line_no = idx as u32 + 1;
            parsed
                .symbols
                .push(SymbolRecord::new(SymbolKind::Function, name, Span::new(line_no, line_no)));
            for callee in words {
                let mut call = CallRecord::new(name, callee);
                call.line = line_no;
                parsed.calls.push(call);
            }
        }
        Ok(parsed)
    }
}

fn module_source(module: usize, modules: usize, functions: usize) -> String {
    let next = (module + 1) % modules;
    (0..functions)
        .map(|f| format!("m{}_f{} m{}_f{} m{}_f{}\n", module, f, module, (f + 1) % functions, next, f))
        .collect()
}

fn synthetic_repo(modules: usize, functions: usize) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for m in 0..modules {
        let path = dir.path().join(format!("pkg{}/mod{}.py", m % 8, m));
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, module_source(m, modules, functions)).expect("write");
    }
    dir
}

fn pipeline(root: &Path) -> Pipeline {
    Pipeline::new(root, EngineConfig::default(), Arc::new(LineParser)).expect("pipeline")
}

fn bench_full_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_rebuild");
    group.sample_size(10);
    for modules in [50usize, 200] {
        let repo = synthetic_repo(modules, 20);
        group.bench_with_input(BenchmarkId::from_parameter(modules), &modules, |b, _| {
            b.iter(|| {
                let pipeline = pipeline(repo.path());
                black_box(pipeline.run_full())
            })
        });
    }
    group.finish();
}

fn bench_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_one_file");
    group.sample_size(20);
    for modules in [50usize, 200] {
        let repo = synthetic_repo(modules, 20);
        let pipeline = pipeline(repo.path());
        pipeline.run_full();
        let key = "pkg1/mod1.py".to_string();
        let abs = repo.path().join(&key);
        let mut flip = false;

        group.bench_with_input(BenchmarkId::new("deferred", modules), &modules, |b, _| {
            b.iter(|| {
                flip = !flip;
                let extra = if flip { "m1_extra\n" } else { "" };
                fs::write(&abs, format!("{}{}", module_source(1, modules, 20), extra)).expect("write");
                black_box(pipeline.run_incremental(std::slice::from_ref(&key), GlobalMode::Deferred))
            })
        });
        group.bench_with_input(BenchmarkId::new("global", modules), &modules, |b, _| {
            b.iter(|| black_box(pipeline.run_global()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_rebuild, bench_incremental);
criterion_main!(benches);
