/// A single wake callback.
pub type WakeHandler = Box<dyn Fn() + Send + Sync + 'static>;

/// Ordered list of wake handlers.
///
/// Handlers run in registration order, one after another, on whichever thread
/// calls `invoke`. The chain is fixed once it is handed to a listener.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<WakeHandler>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the end of the chain.
    pub fn push<F>(&mut self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler once, first registered first.
    pub fn invoke(&self) {
        for handler in &self.handlers {
            handler();
        }
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.len())
            .finish()
    }
}
