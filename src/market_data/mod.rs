pub mod feed;
pub mod spike_filter;
pub mod tick_store;
