mod common;
mod extraction;
mod gates;
mod status_endpoints;
