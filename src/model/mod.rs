//! Domain model shared by the cache, the watchers and the notifiers.

pub mod alerting;
pub mod deployment;
pub mod ids;
pub mod incident;
pub mod metric;
pub mod project;
pub mod status;
pub mod world;

pub use alerting::{alert_fingerprint, Alert, AlertDetail, AlertSource, AlertingRule, AppSelector};
pub use deployment::{
    ApplicationDeployment, ApplicationDeploymentStatus, DeploymentState, MetricsSnapshot,
};
pub use ids::{ApplicationId, ApplicationKind, ProjectId};
pub use incident::{ApplicationIncident, BurnRate, IncidentDetails};
pub use metric::{labels_hash, Labels, MetricValues};
pub use project::{IntegrationType, NotificationKind, Project, ProjectRegistry};
pub use status::Status;
pub use world::{Application, Check, Context, LogPattern, Pattern, Severity, World};
