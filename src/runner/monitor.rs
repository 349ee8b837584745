use crate::NasFloat;
use log::info;
use std::collections::BTreeMap;

/// Running average weighted by batch size.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AverageMeter {
    sum: NasFloat,
    count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, value: NasFloat, n: usize) {
        self.sum += value * n as NasFloat;
        self.count += n;
    }

    pub fn avg(&self) -> NasFloat {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as NasFloat
        }
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Debug, Default)]
pub struct Monitor {
    meters: BTreeMap<String, AverageMeter>,
}

impl Monitor {
    pub fn update(&mut self, name: &str, value: NasFloat, n: usize) {
        self.meters.entry(name.to_string()).or_default().update(value, n);
    }

    pub fn avg(&self, name: &str) -> Option<NasFloat> {
        self.meters.get(name).map(AverageMeter::avg)
    }

    pub fn averages(&self) -> BTreeMap<String, NasFloat> {
        self.meters
            .iter()
            .map(|(k, m)| (k.clone(), m.avg()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.meters.values_mut().for_each(AverageMeter::reset);
    }

    /// Logs the averages of `epoch`.
    pub fn write(&self, epoch: usize) {
        let line = self
            .meters
            .iter()
            .map(|(k, m)| format!("{}={:.4}", k, m.avg()))
            .collect::<Vec<_>>()
            .join(" ");
        info!("epoch {}: {}", epoch, line);
    }
}
