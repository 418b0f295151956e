//! Build one handler out of an ordered chain of stages.
//!
//! `tower::ServiceBuilder` composes layers at the type level. [`compose`] does the
//! same at runtime, for chains assembled from configuration: every item is either a
//! [`Stage`] or the terminal [`Handler`], and the shape of the chain is checked once,
//! when it is built.

use std::fmt;
use std::sync::Arc;

use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

/// A type erased request handler.
pub type Handler<Req, Res> = BoxCloneSyncService<Req, Res, BoxError>;

type Wrap<Req, Res> = dyn Fn(Handler<Req, Res>) -> Handler<Req, Res> + Send + Sync;

/// Wraps the next handler in the chain.
pub struct Stage<Req, Res> {
    wrap: Arc<Wrap<Req, Res>>,
}

impl<Req, Res> Stage<Req, Res> {
    pub fn from_fn<F>(wrap: F) -> Self
    where
        F: Fn(Handler<Req, Res>) -> Handler<Req, Res> + Send + Sync + 'static,
    {
        Self {
            wrap: Arc::new(wrap),
        }
    }

    /// A stage applying `layer` to the next handler.
    pub fn layer<L>(layer: L) -> Self
    where
        L: Layer<Handler<Req, Res>> + Send + Sync + 'static,
        L::Service: Service<Req, Response = Res, Error = BoxError> + Clone + Send + Sync + 'static,
        <L::Service as Service<Req>>::Future: Send + 'static,
        Req: 'static,
    {
        Self::from_fn(move |next| BoxCloneSyncService::new(layer.layer(next)))
    }
}

impl<Req, Res> Clone for Stage<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            wrap: Arc::clone(&self.wrap),
        }
    }
}

impl<Req, Res> fmt::Debug for Stage<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").finish_non_exhaustive()
    }
}

impl<Req, Res> Layer<Handler<Req, Res>> for Stage<Req, Res> {
    type Service = Handler<Req, Res>;

    fn layer(&self, next: Handler<Req, Res>) -> Self::Service {
        (self.wrap)(next)
    }
}

/// One item of a chain passed to [`compose`].
pub enum Link<Req, Res> {
    Stage(Stage<Req, Res>),
    Handler(Handler<Req, Res>),
}

impl<Req, Res> Link<Req, Res> {
    /// A terminal link from any cloneable service.
    pub fn handler<S>(service: S) -> Self
    where
        S: Service<Req, Response = Res, Error = BoxError> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Self::Handler(BoxCloneSyncService::new(service))
    }
}

impl<Req, Res> From<Stage<Req, Res>> for Link<Req, Res> {
    fn from(stage: Stage<Req, Res>) -> Self {
        Self::Stage(stage)
    }
}

impl<Req, Res> From<Handler<Req, Res>> for Link<Req, Res> {
    fn from(handler: Handler<Req, Res>) -> Self {
        Self::Handler(handler)
    }
}

impl<Req, Res> fmt::Debug for Link<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => stage.fmt(f),
            Self::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// A chain that cannot be composed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("compose: expected chain to have at least two items")]
    TooShort,
    #[error("compose: expected last chain item to be a handler")]
    TerminalNotHandler,
    #[error("compose: expected intermediary chain item {index} to be a stage")]
    IntermediaryNotStage { index: usize },
}

/// Compose `links` into one handler.
///
/// The chain is `stage₁, stage₂, …, handler`, and the result behaves like
/// `stage₁(stage₂(…(handler)))`: the first stage sees the request first.
///
/// # Errors
///
/// Fails if fewer than two links are given, if the last link is not a handler, or
/// if any other link is not a stage.
pub fn compose<Req, Res, I>(links: I) -> Result<Handler<Req, Res>, ComposeError>
where
    I: IntoIterator<Item = Link<Req, Res>>,
{
    let mut links: Vec<_> = links.into_iter().collect();
    if links.len() < 2 {
        return Err(ComposeError::TooShort);
    }

    let mut handler = match links.pop() {
        Some(Link::Handler(handler)) => handler,
        _ => return Err(ComposeError::TerminalNotHandler),
    };

    let stages = links
        .into_iter()
        .enumerate()
        .map(|(index, link)| match link {
            Link::Stage(stage) => Ok(stage),
            Link::Handler(_) => Err(ComposeError::IntermediaryNotStage { index }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    for stage in stages.iter().rev() {
        handler = stage.layer(handler);
    }
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use http::Request;
    use tower::ServiceExt;
    use tower::service_fn;
    use tower::util::MapResponseLayer;

    use super::*;

    type Req = Request<()>;

    fn marker(mark: &'static str) -> Stage<Req, String> {
        Stage::layer(MapResponseLayer::new(move |body: String| {
            format!("{mark}{body}")
        }))
    }

    fn terminal() -> Link<Req, String> {
        Link::handler(service_fn(|_req: Req| async {
            Ok::<_, BoxError>(String::from("H"))
        }))
    }

    #[tokio::test]
    async fn stages_run_in_chain_order() {
        let handler = compose([marker("1").into(), marker("2").into(), terminal()]).unwrap();
        assert_eq!(handler.oneshot(Request::new(())).await.unwrap(), "12H");
    }

    #[tokio::test]
    async fn composed_handler_is_reusable() {
        let handler = compose([marker("a").into(), terminal()]).unwrap();
        for _ in 0..3 {
            let out = handler.clone().oneshot(Request::new(())).await.unwrap();
            assert_eq!(out, "aH");
        }
    }

    #[test]
    fn rejects_short_chains() {
        let empty: Vec<Link<Req, String>> = Vec::new();
        assert_eq!(compose(empty).err(), Some(ComposeError::TooShort));
        assert_eq!(compose([terminal()]).err(), Some(ComposeError::TooShort));
    }

    #[test]
    fn rejects_a_stage_in_last_position() {
        let chain: [Link<Req, String>; 2] = [marker("1").into(), marker("2").into()];
        assert_eq!(compose(chain).err(), Some(ComposeError::TerminalNotHandler));
    }

    #[test]
    fn rejects_a_handler_in_the_middle() {
        let err = compose([marker("1").into(), terminal(), terminal()]).err();
        assert_eq!(err, Some(ComposeError::IntermediaryNotStage { index: 1 }));
        assert_eq!(
            err.map(|err| err.to_string()).as_deref(),
            Some("compose: expected intermediary chain item 1 to be a stage")
        );
    }
}
