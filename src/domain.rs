//! Feature views, models and projects built from control-plane metadata and
//! bound to the online stores through the DAO layer.

mod base_feature_view;
mod feature_view;
mod model;
mod online_store;
mod project;
mod sequence_feature_view;

pub use base_feature_view::BaseFeatureView;
pub use feature_view::FeatureView;
pub use model::{JoinIds, Model};
pub use online_store::OnlineStore;
pub use project::{Project, ProjectResources};
pub use sequence_feature_view::SequenceFeatureView;
