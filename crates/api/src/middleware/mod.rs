pub mod auth;
pub mod matched_route;
