use crate::bitmap::live_set::LiveSet;

/// Column reductions. Sums are Kahan-compensated; averages exclude null
/// lanes from the count; min/max track a sentinel and the winning lane.

#[derive(Debug, Clone, Copy, Default)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        KahanSum::default()
    }

    pub fn add(&mut self, x: f64) {
        let y = x - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn sub(&mut self, x: f64) {
        self.add(-x);
    }

    pub fn value(&self) -> f64 {
        self.sum
    }
}

pub fn sum(values: &[f64], nulls: &LiveSet) -> f64 {
    let mut acc = KahanSum::new();
    for (i, &v) in values.iter().enumerate() {
        if !nulls.test(i) {
            acc.add(v);
        }
    }
    acc.value()
}

/// Average over non-null lanes; `None` when every lane is null.
pub fn avg(values: &[f64], nulls: &LiveSet) -> Option<f64> {
    let count = values.len() - nulls.cardinality().min(values.len());
    if count == 0 {
        return None;
    }
    Some(sum(values, nulls) / count as f64)
}

/// Minimum over non-null lanes with the winning position.
pub fn min(values: &[f64], nulls: &LiveSet) -> Option<(f64, usize)> {
    let mut best: Option<(f64, usize)> = None;
    for (i, &v) in values.iter().enumerate() {
        if nulls.test(i) {
            continue;
        }
        match best {
            Some((b, _)) if b <= v => {}
            _ => best = Some((v, i)),
        }
    }
    best
}

pub fn max(values: &[f64], nulls: &LiveSet) -> Option<(f64, usize)> {
    let mut best: Option<(f64, usize)> = None;
    for (i, &v) in values.iter().enumerate() {
        if nulls.test(i) {
            continue;
        }
        match best {
            Some((b, _)) if b >= v => {}
            _ => best = Some((v, i)),
        }
    }
    best
}

pub fn count_non_null(values: &[f64], nulls: &LiveSet) -> usize {
    values.len() - nulls.cardinality().min(values.len())
}
