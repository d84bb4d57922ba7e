//! API-metadata repository: projects, endpoints, parameters, response
//! fields, field links and response messages.

mod model;
mod store;

pub use model::{
    Endpoint, FieldLink, HttpMethod, NewEndpoint, NewParameter, NewProject, ParamLocation,
    Project, RequestParameter, ResponseField, ResponseMessage,
};
pub use store::{CatalogError, CatalogStore, EndpointDetail, ProjectSnapshot};
