pub mod batch_analysis;
pub mod classification;
pub mod cross_reference;
pub mod keyword_search;
pub mod metadata_filter;
pub mod resource_action;
