pub mod async_task;
pub mod context;
pub mod custom_http;
pub mod model_list;

pub use async_task::{ASYNC_TASK_FILTER, AsyncTaskConfig, AsyncTaskFilter};
pub use context::{CONTEXT_FILTER, ContextFilter};
pub use custom_http::{CUSTOM_HTTP_DIRECTOR, CustomHttpDirector, apply_api_config, apply_directive};
pub use model_list::{MODEL_LIST_FILTER, ModelListFilter};
