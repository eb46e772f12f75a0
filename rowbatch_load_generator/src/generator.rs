//! Random row mutations.

use rand::{Rng, SeedableRng, distributions::Alphanumeric, rngs::StdRng};
use rowbatch_write::{ColumnValue, PrimaryKey, RowChange, RowMutation, TimeSeriesKey};

pub(crate) const TABLE: &str = "load";
pub(crate) const MEASUREMENT: &str = "cpu";

const TENANTS: u64 = 16;
const REGIONS: [&str; 4] = ["us-east", "us-west", "eu-central", "ap-south"];

/// Shape of the generated rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowShape {
    /// Rows of [`TABLE`] keyed by `(tenant, id)`.
    Relational,
    /// Points of the [`MEASUREMENT`] series, one series per host.
    TimeSeries,
}

/// Generates rows addressing one of `keys` distinct rows or series.
#[derive(Debug)]
pub(crate) struct RowGenerator {
    shape: RowShape,
    keys: u64,
    rng: StdRng,
}

impl RowGenerator {
    pub(crate) fn new(shape: RowShape, keys: u64, seed: u64) -> Self {
        Self {
            shape,
            keys: keys.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn next_row(&mut self) -> RowMutation {
        let k = self.rng.gen_range(0..self.keys);
        match self.shape {
            RowShape::Relational => self.relational(k),
            RowShape::TimeSeries => self.time_series(k),
        }
    }

    pub(crate) fn next_group(&mut self, size: usize) -> Vec<RowMutation> {
        (0..size).map(|_| self.next_row()).collect()
    }

    fn relational(&mut self, k: u64) -> RowMutation {
        let key = PrimaryKey::new()
            .with_column("tenant", format!("tenant-{}", k % TENANTS))
            .with_column("id", k as i64);

        let change = if self.rng.gen_ratio(1, 20) {
            RowChange::delete()
        } else {
            let note = (&mut self.rng)
                .sample_iter(&Alphanumeric)
                .take(12)
                .map(char::from)
                .collect::<String>();
            RowChange::put()
                .with_column("value", ColumnValue::Double(self.rng.gen_range(0.0..1000.0)))
                .with_column("active", ColumnValue::Boolean(self.rng.gen_bool(0.5)))
                .with_column("note", ColumnValue::String(note))
        };

        RowMutation::new(TABLE, key, change)
    }

    fn time_series(&mut self, k: u64) -> RowMutation {
        let key = TimeSeriesKey::new(MEASUREMENT, format!("host-{k}"))
            .with_tag("region", REGIONS[k as usize % REGIONS.len()]);

        let change = RowChange::put()
            .with_column(
                "usage_user",
                ColumnValue::Double(self.rng.gen_range(0.0..100.0)),
            )
            .with_column(
                "usage_system",
                ColumnValue::Double(self.rng.gen_range(0.0..100.0)),
            )
            .with_column(
                "processes",
                ColumnValue::Integer(self.rng.gen_range(1..2048)),
            );

        RowMutation::new(MEASUREMENT, key, change)
    }
}
