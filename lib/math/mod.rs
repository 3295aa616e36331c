pub mod histogram;

pub use histogram::{
    HistogramError, MedianSnapshot, MedianWatch, Poll, TickHistogram, median,
};
