//! Ordering of exclusive calls within a batch.
//!
//! Every exclusive call of a batch gets a [`LaneTicket`], chained to the
//! ticket of the exclusive call requested before it. A call may only start
//! once the previous ticket is released, and a ticket is only released
//! after all the tickets before it are.

use tokio::sync::oneshot;

#[derive(Default)]
pub(crate) struct ExclusiveLane {
    last: Option<oneshot::Receiver<()>>,
}

impl ExclusiveLane {
    /// Issues the ticket of the next exclusive call.
    pub fn ticket(&mut self) -> LaneTicket {
        let (done, next) = oneshot::channel();
        LaneTicket {
            prev: self.last.replace(next),
            done,
        }
    }
}

pub(crate) struct LaneTicket {
    prev: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

impl LaneTicket {
    /// Waits until every earlier exclusive call is terminal.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe, it can be awaited again later.
    pub async fn wait_turn(&mut self) {
        if let Some(prev) = self.prev.as_mut() {
            // A dropped sender releases us as well.
            let _ = prev.await;
            self.prev = None;
        }
    }

    /// Lets the next exclusive call go, once the earlier ones are done.
    pub async fn release(mut self) {
        self.wait_turn().await;
        let _ = self.done.send(());
    }
}
