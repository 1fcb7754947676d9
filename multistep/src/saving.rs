//! Storage for integration output.
//!
//! The driver records every accepted `(t, y)` pair either into a growable
//! in-memory buffer or incrementally into a CSV file; saving can also be
//! disabled entirely when the model handles its own output.

use std::{fs::File, io::BufWriter, path::PathBuf};

use csv::Writer;

use crate::error::SolverError;
use crate::state::{OdeVector, StateVector};

/// CSV formatting for a state type. The default implementation panics so
/// that state types without a natural flat representation can still be
/// integrated with memory-only saving.
pub trait Record {
    fn headers(&self) -> Vec<String> {
        Vec::new()
    }

    fn write_record(
        &self,
        _t: f64,
        _writer: &mut Writer<BufWriter<File>>,
    ) -> Result<(), SolverError> {
        panic!(
            "CSV writing not implemented for this state. Implement 'headers' and 'write_record' to enable file saving."
        );
    }
}

impl Record for StateVector {
    fn headers(&self) -> Vec<String> {
        let mut headers = vec!["t".to_string()];
        headers.extend((0..self.len()).map(|i| format!("x{i}")));
        headers
    }

    fn write_record(
        &self,
        t: f64,
        writer: &mut Writer<BufWriter<File>>,
    ) -> Result<(), SolverError> {
        let mut row = Vec::with_capacity(self.len() + 1);
        row.push(t.to_string());
        row.extend(self.iter().map(|x| x.to_string()));
        writer
            .write_record(&row)
            .map_err(|e| SolverError::IllInput(format!("csv write failed: {e}")))
    }
}

/// Specifies the saving strategy to be used by the driver.
pub enum SaveMethod {
    /// Save state data in memory using `MemoryResult`.
    Memory,
    /// Write state data incrementally to a CSV file at the given path.
    File(PathBuf),
    /// Do not save driver output; the model handles all output itself.
    None,
}

/// Runtime storage for solver results, selected from the `SaveMethod`.
#[derive(Debug)]
pub enum ResultStorage<State>
where
    State: OdeVector + Record,
{
    Memory(MemoryResult<State>),
    File(Writer<BufWriter<File>>),
    None,
}

impl<State: OdeVector + Record> ResultStorage<State> {
    /// Builds storage for a run expected to record about `capacity` entries.
    pub fn build(
        method: &SaveMethod,
        capacity: usize,
        template: &State,
    ) -> Result<Self, SolverError> {
        match method {
            SaveMethod::Memory => Ok(ResultStorage::Memory(MemoryResult::new(capacity.max(1)))),
            SaveMethod::File(path) => {
                let file = File::create(path).map_err(|e| {
                    SolverError::IllInput(format!(
                        "could not create result file {}: {e}",
                        path.display()
                    ))
                })?;
                let mut writer = Writer::from_writer(BufWriter::new(file));
                writer
                    .write_record(template.headers())
                    .map_err(|e| SolverError::IllInput(format!("csv write failed: {e}")))?;
                Ok(ResultStorage::File(writer))
            }
            SaveMethod::None => Ok(ResultStorage::None),
        }
    }

    /// Save a `(time, state)` pair to the result store. No-op when storage
    /// is `None`.
    pub fn save(&mut self, t: f64, y: &State) -> Result<(), SolverError> {
        match self {
            ResultStorage::Memory(result) => {
                result.insert(t, y);
                Ok(())
            }
            ResultStorage::File(writer) => y.write_record(t, writer),
            ResultStorage::None => Ok(()),
        }
    }

    /// Finalize the result storage: drop unused buffer capacity or flush the
    /// file writer.
    pub fn truncate(&mut self) -> Result<(), SolverError> {
        match self {
            ResultStorage::Memory(result) => {
                result.truncate();
                Ok(())
            }
            ResultStorage::File(writer) => writer
                .flush()
                .map_err(|e| SolverError::IllInput(format!("csv flush failed: {e}"))),
            ResultStorage::None => Ok(()),
        }
    }
}

/// A preallocated and growable result container for in-memory storage of
/// solver outputs. Each entry stores the time and state value at that time.
#[derive(Debug)]
pub struct MemoryResult<State>
where
    State: OdeVector,
{
    pub t: Vec<f64>,
    pub y: Vec<State>,
    i: usize, // current insert index
}

impl<State: OdeVector> MemoryResult<State> {
    pub fn new(n: usize) -> Self {
        Self {
            t: vec![0.0; n],
            y: vec![State::default(); n],
            i: 0,
        }
    }

    /// Number of saved entries (not the buffer capacity).
    pub fn len(&self) -> usize {
        self.i
    }

    pub fn is_empty(&self) -> bool {
        self.i == 0
    }

    fn insert(&mut self, t: f64, x: &State) {
        if self.i == self.t.len() {
            self.extend();
        }
        self.t[self.i] = t;
        self.y[self.i].clone_from(x);
        self.i += 1;
    }

    fn capacity(&self) -> usize {
        self.t.len()
    }

    // doubles the length when capacity is reached
    fn extend(&mut self) {
        self.t.extend(vec![0.0; self.capacity()]);
        self.y.extend(vec![State::default(); self.capacity()]);
    }

    fn truncate(&mut self) {
        self.t.truncate(self.i);
        self.y.truncate(self.i);
    }
}
