// cdm-common: shared domain types for the CDM collaboration workspace

pub mod approval;
pub mod events;
pub mod types;
