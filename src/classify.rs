//! The value classifier: bounded-sample inference of a column's domain.
//!
//! Classification is elimination-based: every candidate domain starts
//! possible and each observed value rules candidates out. The decision
//! precedence mirrors how the survey publishes data: temporal patterns
//! first, then integral vs fractional numerics, then the strict boolean
//! vocabulary, with text (and long-text past the length threshold) as the
//! fallback.
//!
//! Suppression markers never participate in inference; they are tallied in
//! [`ColumnObservation::sentinel_count`] and handled at migration time.

use crate::{
    data,
    domain::ValueDomain,
    workbook::CellValue,
};

pub const DEFAULT_SAMPLE_SIZE: usize = 2000;
pub const DEFAULT_LONG_TEXT_THRESHOLD: usize = 255;
const MAX_RETAINED_SAMPLES: usize = 8;

/// Accumulated evidence about one column.
#[derive(Debug, Clone)]
pub struct ColumnObservation {
    sample_size: usize,
    long_text_threshold: usize,
    possible_integer: bool,
    possible_decimal: bool,
    possible_boolean: bool,
    possible_date: bool,
    possible_datetime: bool,
    pub classified: usize,
    pub empty_count: usize,
    pub sentinel_count: usize,
    pub max_length: usize,
    pub samples: Vec<String>,
}

impl ColumnObservation {
    pub fn new(sample_size: usize, long_text_threshold: usize) -> Self {
        ColumnObservation {
            sample_size: sample_size.max(1),
            long_text_threshold,
            possible_integer: true,
            possible_decimal: true,
            possible_boolean: true,
            possible_date: true,
            possible_datetime: true,
            classified: 0,
            empty_count: 0,
            sentinel_count: 0,
            max_length: 0,
            samples: Vec::new(),
        }
    }

    pub fn saw_null(&self) -> bool {
        self.empty_count > 0
    }

    /// Feeds one cell into the observation. Inference stops contributing
    /// after `sample_size` classified values; emptiness and sentinel tallies
    /// keep accumulating.
    pub fn observe(&mut self, cell: &CellValue) {
        if cell.is_empty() {
            self.empty_count += 1;
            return;
        }
        let rendered = cell.display();
        self.max_length = self.max_length.max(rendered.chars().count());

        if let CellValue::Text(raw) = cell {
            if data::is_sentinel(raw) {
                self.sentinel_count += 1;
                return;
            }
        }
        if self.classified >= self.sample_size {
            return;
        }
        self.classified += 1;
        if self.samples.len() < MAX_RETAINED_SAMPLES {
            self.samples.push(rendered);
        }

        match cell {
            CellValue::Int(_) => {
                self.possible_boolean = false;
                self.possible_date = false;
                self.possible_datetime = false;
            }
            CellValue::Float(f) => {
                self.possible_boolean = false;
                self.possible_date = false;
                self.possible_datetime = false;
                if f.fract() != 0.0 {
                    self.possible_integer = false;
                }
            }
            CellValue::Bool(_) => {
                self.possible_integer = false;
                self.possible_decimal = false;
                self.possible_date = false;
                self.possible_datetime = false;
            }
            CellValue::DateTime(dt) => {
                self.possible_integer = false;
                self.possible_decimal = false;
                self.possible_boolean = false;
                if dt.time() != chrono::NaiveTime::MIN {
                    self.possible_date = false;
                }
            }
            CellValue::Text(raw) => self.observe_text(raw.trim()),
            CellValue::Empty => unreachable!("empty cells are tallied above"),
        }
    }

    fn observe_text(&mut self, value: &str) {
        if self.possible_date && data::parse_naive_date(value).is_none() {
            self.possible_date = false;
        }
        if self.possible_datetime
            && data::parse_naive_datetime(value).is_none()
            && data::parse_naive_date(value).is_none()
        {
            self.possible_datetime = false;
        }
        if self.possible_boolean && !data::is_boolean_token(value) {
            self.possible_boolean = false;
        }
        if self.possible_integer && value.parse::<i64>().is_err() {
            self.possible_integer = false;
        }
        if self.possible_decimal && value.parse::<rust_decimal::Decimal>().is_err() {
            self.possible_decimal = false;
        }
    }

    /// Resolves the accumulated evidence into one domain.
    pub fn decide(&self) -> ValueDomain {
        if self.classified == 0 {
            // No usable evidence (all empty or suppressed): default to text.
            return ValueDomain::Text;
        }
        if self.possible_date {
            return ValueDomain::Date;
        }
        if self.possible_datetime {
            return ValueDomain::DateTime;
        }
        if self.possible_integer {
            return ValueDomain::Integer;
        }
        if self.possible_decimal {
            return ValueDomain::Decimal;
        }
        if self.possible_boolean {
            return ValueDomain::Boolean;
        }
        if self.max_length > self.long_text_threshold {
            ValueDomain::LongText
        } else {
            ValueDomain::Text
        }
    }
}
