mod cucumber;

use ::cucumber::{codegen::LocalBoxFuture, event::ScenarioFinished, gherkin, writer, World};
use futures_util::FutureExt;
use log::*;
use tokio::runtime::Runtime;

use crate::cucumber::AgoraWorld;

fn main() {
    dotenvy::from_filename(".env.test").ok();
    env_logger::init();
    let sys = Runtime::new().unwrap();
    sys.block_on(
        AgoraWorld::cucumber()
            .with_writer(writer::Libtest::or_basic())
            .after(|_f, _r, scenario, ev, w| post_test_hook(scenario, ev, w))
            .run("tests/features"),
    );
    info!("🚀️ Tests complete");
}

fn post_test_hook<'a>(
    scenario: &'a gherkin::Scenario,
    ev: &'a ScenarioFinished,
    world: Option<&'a mut AgoraWorld>,
) -> LocalBoxFuture<'a, ()> {
    let fut = async move {
        debug!("🚀️ After-scenario hook running for \"{}\"", scenario.name);
        if let ScenarioFinished::StepFailed(..) = ev {
            warn!("🚀️ \"{}\" failed. Final world: {world:?}", scenario.name);
        }
        if let Some(w) = world {
            if let Some(market) = w.market.take() {
                for node in [&market.buyer, &market.vendor, &market.moderator] {
                    node.api.db().close().await;
                }
            }
            if let Some(restored) = w.restored.take() {
                restored.api.db().close().await;
            }
        }
    };
    fut.boxed_local()
}
