use rocket::Route;

mod admin;
mod votes;

pub use votes::{VerificationView, VoteRequest, VoteView};

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(admin::routes());
    routes.extend(votes::routes());
    routes
}
