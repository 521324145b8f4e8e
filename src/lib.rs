pub mod config;
pub mod correlate;
pub mod error;
pub mod event;
pub mod hash;
pub mod io;
pub mod string_intern;
pub mod traits;
pub mod tracedat;
pub mod writer;

// Export the reader seam
pub use traits::{CpuInfo, EventCallback, TraceInfo, TraceReader};

// Export the event model
pub use event::{EventField, EventFlags, EventId, EventKind, TraceEvent};

// Export the trace.dat implementation
pub use error::DecodeError;
pub use tracedat::{decode_trace, TraceDatReader};

// Export correlation
pub use correlate::{Correlation, CorrelationStats, EventCorrelator, Timeline, TimelineFamily};

// Export loading
pub use config::LoadOptions;
pub use io::{load_trace, AsyncLoader, LoadProgress, LoadResult, LoadStatus, LoadedTrace};

// Export writer
pub use writer::{FieldType, FieldValue, TraceDatWriter};

// Export string interning utility
pub use string_intern::StringPool;
