use omsg::{Error, MessageSender, Request, Response};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::context::Delivery;

/// Sender-side handle of a receiving context.
///
/// Each send is one exchange: it resolves with exactly one result.
#[derive(Clone, Debug)]
pub struct Port {
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
    sender: MessageSender,
}

impl Port {
    pub(crate) fn new(tx: mpsc::Sender<Delivery>, token: CancellationToken) -> Self {
        Self {
            tx,
            token,
            sender: MessageSender::default(),
        }
    }

    /// Identify the sending side to listeners.
    pub fn with_sender(mut self, sender: MessageSender) -> Self {
        self.sender = sender;
        self
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Send an already serialized request envelope.
    pub async fn send_raw(&self, payload: String) -> Result<Response, Error> {
        if self.token.is_cancelled() {
            return Err(Error::NoReceiver);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Delivery { payload, reply_tx })
            .await
            .map_err(|_| Error::NoReceiver)?;

        reply_rx.await.map_err(|_| Error::NoReceiver)?
    }

    /// Send `message` and wait for the receiving context's single result.
    pub async fn send_message(&self, message: &impl Serialize) -> Result<Response, Error> {
        let payload = Request::new(message)?
            .with_sender(self.sender.clone())
            .to_json()?;
        self.send_raw(payload).await
    }

    /// Send `message` in the background and hand the result to `callback`.
    pub fn send_message_with_callback<F>(
        &self,
        message: &impl Serialize,
        callback: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        let payload = Request::new(message).and_then(|request| {
            request.with_sender(self.sender.clone()).to_json()
        });
        let port = self.clone();
        tokio::spawn(async move {
            let result = match payload {
                Ok(payload) => port.send_raw(payload).await,
                Err(err) => Err(err),
            };
            callback(result);
        })
    }
}
