use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use oews_warehouse::{
    ValueDomain,
    classify::{DEFAULT_LONG_TEXT_THRESHOLD, DEFAULT_SAMPLE_SIZE, ColumnObservation},
    workbook::CellValue,
};

fn synthetic_column(rows: usize) -> Vec<CellValue> {
    (0..rows)
        .map(|idx| match idx % 7 {
            0 => CellValue::Text("0100000".to_string()),
            1 => CellValue::Int(idx as i64),
            2 => CellValue::Text("17.85".to_string()),
            3 => CellValue::Text("#".to_string()),
            4 => CellValue::Empty,
            5 => CellValue::Text("2019-05-14".to_string()),
            _ => CellValue::Text("Registered Nurses".to_string()),
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let cells = synthetic_column(10_000);
    c.bench_function("classify_10k_mixed_cells", |b| {
        b.iter(|| {
            let mut observation =
                ColumnObservation::new(DEFAULT_SAMPLE_SIZE, DEFAULT_LONG_TEXT_THRESHOLD);
            for cell in &cells {
                observation.observe(black_box(cell));
            }
            black_box(observation.decide())
        })
    });
}

fn bench_lattice(c: &mut Criterion) {
    let domains = [
        ValueDomain::Integer,
        ValueDomain::Decimal,
        ValueDomain::Text,
        ValueDomain::Date,
        ValueDomain::Boolean,
        ValueDomain::LongText,
        ValueDomain::DateTime,
    ];
    c.bench_function("lattice_fold_7_domains", |b| {
        b.iter(|| ValueDomain::resolve_all(black_box(domains).into_iter()))
    });
}

criterion_group!(benches, bench_classify, bench_lattice);
criterion_main!(benches);
