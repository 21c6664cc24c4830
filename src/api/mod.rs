use crate::AppState;
use axum::Router;

pub mod export;
pub mod stow;
pub mod wado;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new()
		.merge(wado::routes())
		.merge(stow::routes())
		.merge(export::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}
