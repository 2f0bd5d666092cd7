use crate::velokeys::{mutex_poison, EventRegAsync, KeyEvent};

// Heavily dependent on the synchronous code to do the real work. This
// async code will hold regular mutexes, etc., but never for any
// length of time.

impl EventRegAsync {
    /// Get next key event, whatever it be.
    pub fn get_next_key_event(&mut self) -> Option<KeyEvent> {
        self.real_event_reg.get_next_key_event()
    }

    /// Get next key event that matches supplied mask, or `None`. Any
    /// older key events in the queue that do not match the mask will
    /// remain in the queue.
    pub fn get_next_key_event_masked(&mut self, mask: &[bool]) -> Option<KeyEvent> {
        self.real_event_reg.get_next_key_event_masked(mask)
    }

    /// Get a copy of the first `requested_number` queued events,
    /// leaving them in the queue, all unchanged.
    pub fn peek_next_n_events(&mut self, requested_number: usize) -> Option<Vec<KeyEvent>> {
        self.real_event_reg.peek_next_n_events(requested_number)
    }

    /// Return `requested_number` of matching events in an `Option`,
    /// or if there aren't that many, return `None` (leaving event
    /// queue unchanged).
    pub fn get_next_n_events_masked(
        &mut self,
        mask: &[bool],
        requested_number: usize,
    ) -> Option<Vec<KeyEvent>> {
        self.real_event_reg
            .get_next_n_events_masked(mask, requested_number)
    }

    /// Await for next key event, whatever it be.
    pub async fn wait_next_key_event(&mut self) -> Option<KeyEvent> {
        let everything = vec![true; self.real_event_reg.num_keys()];
        self.wait_next_key_event_masked(&everything).await
    }

    /// Await for one event.
    ///
    /// # Panics
    ///
    /// In the case of a logic error where asking
    /// `wait_next_n_key_events_masked()` for one event giving us some
    /// other number.
    pub async fn wait_next_key_event_masked(&mut self, mask: &[bool]) -> Option<KeyEvent> {
        match self.wait_next_n_key_events_masked(mask, 1).await {
            Some(events) => {
                assert!(events.len() == 1);
                Some(events[0])
            }
            None => None,
        }
    }

    /// Return exactly `requested_number` events.
    ///
    /// # Panics
    ///
    /// Will panic if `tokio::sync::watch::changed()` returns an
    /// error.
    pub async fn wait_next_n_key_events_masked(
        &mut self,
        mask: &[bool],
        requested_number: usize,
    ) -> Option<Vec<KeyEvent>> {
        // Mark the watch as seen *before* looking at the queue. An
        // event that lands after we look then still shows up as a
        // change, and we don't sleep through it.
        let mut chan_read = {
            let reg_inner_locked = self
                .real_event_reg
                .reg_inner
                .lock()
                .unwrap_or_else(mutex_poison);
            reg_inner_locked.async_receiver.clone()
        }; // reg_inner lock freed.
        let _ = chan_read.borrow_and_update();

        loop {
            if let Some(real_events) = self.get_next_n_events_masked(mask, requested_number) {
                return Some(real_events);
            }

            if let Err(e) = chan_read.changed().await {
                panic!("tokio::sync::watch unexpected error: {e:?}");
            }
        }
    }

    /// Throw away all queued key events for this `EventRegAsync`.
    pub fn clear_queue(&mut self) {
        self.real_event_reg.clear_queue();
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.real_event_reg.size_hint().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
