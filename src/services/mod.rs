pub mod direction;
pub mod pipeline;
pub mod stations;
pub mod transform;

pub use direction::{analyze_direction, Confidence, DirectionAnalysis};
pub use pipeline::{group_vehicles, process_vehicles, PipelineOptions};
pub use stations::{select_stations, SelectionCriteria, StationSelection};
pub use transform::{transform_vehicles, TransformContext, TransformedVehicleData};
