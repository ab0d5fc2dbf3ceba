mod broken_fields;
mod common;
mod cycle_detection;
mod lookup;
