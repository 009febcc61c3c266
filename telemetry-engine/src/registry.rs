use std::{collections::HashMap, fs::File, path::Path};

use parking_lot::RwLock;

use crate::{
    domain::{Category, Meter, MeterStatus},
    error::{EngineError, Result},
};

/// Read-only view of the external meter registry.
pub trait MeterRegistry: Send + Sync {
    fn lookup(&self, meter_id: &str) -> Option<Meter>;
}

/// Registry held in memory, typically loaded once at startup from CSV.
#[derive(Default)]
pub struct InMemoryRegistry {
    meters: RwLock<HashMap<String, Meter>>,
}

impl InMemoryRegistry {
    pub fn new<I>(meters: I) -> Self
    where
        I: IntoIterator<Item = Meter>,
    {
        let meters = meters.into_iter().map(|m| (m.meter_id.clone(), m)).collect();
        Self {
            meters: RwLock::new(meters),
        }
    }

    /// Load from a CSV file with header `meter_id,region,category,status`.
    ///
    /// `status` may be omitted or blank, meaning active.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| EngineError::Registry(format!("failed to open {}: {e}", path.display())))?;
        Self::from_csv_reader(file)
    }

    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| EngineError::Registry(format!("failed to read CSV headers: {e}")))?
            .clone();

        let mut meters = Vec::new();
        for (idx, result) in rdr.records().enumerate() {
            let row = idx + 2;
            let record =
                result.map_err(|e| EngineError::Registry(format!("row {row}: failed to read record: {e}")))?;

            let get = |name: &str| -> Option<&str> {
                headers
                    .iter()
                    .position(|h| h == name)
                    .and_then(|i| record.get(i))
                    .map(str::trim)
            };

            let meter_id = get("meter_id")
                .filter(|s| !s.is_empty())
                .ok_or_else(|| EngineError::Registry(format!("row {row}: missing meter_id")))?;
            let region = get("region")
                .filter(|s| !s.is_empty())
                .ok_or_else(|| EngineError::Registry(format!("row {row}: missing region")))?;
            let category: Category = get("category")
                .unwrap_or("")
                .parse()
                .map_err(|e| EngineError::Registry(format!("row {row}: {e}")))?;
            let status = match get("status") {
                None | Some("") => MeterStatus::Active,
                Some(s) => s
                    .parse()
                    .map_err(|e| EngineError::Registry(format!("row {row}: {e}")))?,
            };

            meters.push(Meter {
                meter_id: meter_id.to_string(),
                region: region.to_string(),
                category,
                status,
            });
        }

        tracing::info!(meters = meters.len(), "meter registry loaded");
        Ok(Self::new(meters))
    }

    /// Add or replace a registration. Used when the registry is fed by a sync job.
    pub fn upsert(&self, meter: Meter) {
        self.meters.write().insert(meter.meter_id.clone(), meter);
    }

    pub fn len(&self) -> usize {
        self.meters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MeterRegistry for InMemoryRegistry {
    fn lookup(&self, meter_id: &str) -> Option<Meter> {
        self.meters.read().get(meter_id).cloned()
    }
}
