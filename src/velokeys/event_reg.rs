use crate::velokeys::{mutex_poison, try_send_error, EventReg, EventRegInner, KeyEvent, KeyPosition};
use crossbeam_channel;
use std::time::{Duration, Instant};

/// Is this key wanted by this mask? Keys past the end of the mask are
/// not.
fn mask_wants(mask: &[bool], key_index: usize) -> bool {
    mask.get(key_index).copied().unwrap_or(false)
}

impl EventReg {
    /// Get next key event, whatever it be.
    pub fn get_next_key_event(&mut self) -> Option<KeyEvent> {
        self.reg_inner
            .lock()
            .unwrap_or_else(mutex_poison)
            .event_queue
            .lock()
            .unwrap_or_else(mutex_poison)
            .pop_front()
    } // reg_inner lock freed; event_queue lock freed.

    /// Get next key event that matches supplied mask, or `None`. Any
    /// older key events in the queue that do not match the mask will
    /// remain in the queue.
    pub fn get_next_key_event_masked(&mut self, mask: &[bool]) -> Option<KeyEvent> {
        self.get_next_n_events_masked(mask, 1).map(|x| x[0])
    }

    /// Get a copy of the first `requested_number` queued events,
    /// leaving them in the queue, all unchanged.
    ///
    /// If there are not that many events queued, return a copy of as
    /// many as there are. If there are none return `None`.
    pub fn peek_next_n_events(&mut self, requested_number: usize) -> Option<Vec<KeyEvent>> {
        let reg_inner = self.reg_inner.lock().unwrap_or_else(mutex_poison);
        let locked_queue = reg_inner.event_queue.lock().unwrap_or_else(mutex_poison);

        let peek_vec: Vec<KeyEvent> = locked_queue.iter().take(requested_number).copied().collect();

        if peek_vec.is_empty() {
            None
        } else {
            Some(peek_vec)
        }
    } // reg_inner lock freed; event_queue lock freed.

    /// Return `requested_number` of matching events in an `Option`,
    /// or if there aren't that many, return `None` (leaving event
    /// queue unchanged).
    ///
    /// # Panics
    ///
    /// In the case of a logic error where an entry appears to vanish
    /// from the queue between the time when we found it and the time
    /// when we try to remove it, we will panic.
    pub fn get_next_n_events_masked(
        &mut self,
        mask: &[bool],
        requested_number: usize,
    ) -> Option<Vec<KeyEvent>> {
        let mut found_indices = Vec::with_capacity(requested_number);

        let reg_inner = self.reg_inner.lock().unwrap_or_else(mutex_poison);
        let mut locked_queue = reg_inner.event_queue.lock().unwrap_or_else(mutex_poison);

        for (index, event) in locked_queue.iter().enumerate() {
            if mask_wants(mask, event.key_index) {
                found_indices.push(index);
                if found_indices.len() == requested_number {
                    break;
                };
            };
        }

        if found_indices.len() == requested_number {
            // Found indices are ordered oldest to newest. To remove
            // them one at a time by index go newest to oldest
            // (highest index to lowest index).
            let mut found_events: Vec<KeyEvent> = Vec::with_capacity(requested_number);
            for index in found_indices.iter().rev() {
                let Some(one_event) = locked_queue.remove(*index) else {
                    // We just SAW an item with that index.
                    panic!("event vanished from locked_queue");
                };
                found_events.push(one_event);
            }

            // Collected backwards.
            found_events.reverse();

            Some(found_events)
        } else {
            // All that were asked for, or none.
            None
        }
    } // reg_inner lock freed; event_queue lock freed.

    /// Synchronous wait for next key event, whatever it be.
    pub fn wait_next_key_event(&mut self, timeout: Duration) -> Option<KeyEvent> {
        let everything = vec![true; self.num_keys()];
        self.wait_next_key_event_masked(&everything, timeout)
    }

    /// Synchronous wait for one event.
    ///
    /// # Panics
    ///
    /// In the case of a logic error where asking
    /// `wait_next_n_key_events_masked()` for one event giving us some
    /// other number.
    pub fn wait_next_key_event_masked(
        &mut self,
        mask: &[bool],
        timeout: Duration,
    ) -> Option<KeyEvent> {
        match self.wait_next_n_key_events_masked(mask, 1, timeout) {
            Some(events) => {
                assert!(events.len() == 1);
                Some(events[0])
            }
            None => None,
        }
    }

    /// Synchronous wait for events.
    ///
    /// # Panics
    ///
    /// A `Disconnected` error from cross-beam `recv_timeout()` will
    /// panic.
    pub fn wait_next_n_key_events_masked(
        &mut self,
        mask: &[bool],
        requested_number: usize,
        mut timeout: Duration,
    ) -> Option<Vec<KeyEvent>> {
        // Limit timeout to a billion years, to avoid overflow
        // problems doing arithmetic near Duration::MAX.
        const BIG_DURATION: Duration = Duration::from_secs(1_000_000_000 * 365 * 24 * 60 * 60);
        if timeout > BIG_DURATION {
            timeout = BIG_DURATION;
        }

        // Note our original deadline only once.
        let deadline_instant = Instant::now() + timeout;

        // Call until we get a result or have passed the deadline.
        loop {
            // We might call this when no event is ready for us. That's okay.
            let possible_events = self.get_next_n_events_masked(mask, requested_number);

            if let Some(real_events) = possible_events {
                return Some(real_events);
            }

            let now = Instant::now();
            if deadline_instant < now {
                return None;
            }

            // Wait until a new event appears.
            //
            // Could an event arrive between the look above and the
            // wait below and be missed? No: its wake message will be
            // waiting in the channel, we receive it right away, and
            // loop to look again.
            let chan_read = {
                let reg_inner_locked = self.reg_inner.lock().unwrap_or_else(mutex_poison);
                reg_inner_locked.sync_receiver.clone()
            }; // reg_inner lock freed.

            match chan_read.recv_timeout(deadline_instant - now) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    return None;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    panic!(
                        "crossbeam_channel::Receiver::recv_timeout() unexpected Disconnected error"
                    );
                }
                Ok(_) => {
                    // We don't care about the value.
                    continue;
                }
            };
        }
    }

    /// Throw away all queued key events for this `EventReg`.
    pub fn clear_queue(&mut self) {
        let reg_inner = self.reg_inner.lock().unwrap_or_else(mutex_poison);
        let mut event_queue_locked = reg_inner.event_queue.lock().unwrap_or_else(mutex_poison);

        event_queue_locked.clear();
    } // reg_inner lock freed; event_queue lock freed.

    /// Number of keys the masks cover.
    pub fn num_keys(&self) -> usize {
        self.reg_inner
            .lock()
            .unwrap_or_else(mutex_poison)
            .press_mask
            .len()
    }

    /// Total events queued since registration, including any since
    /// dropped or read.
    pub fn event_count(&self) -> usize {
        self.reg_inner.lock().unwrap_or_else(mutex_poison).event_count
    }
}

impl Iterator for EventReg {
    type Item = KeyEvent;

    /// Read key events as iterator.
    ///
    /// Note: This iterator changes size as new key events happen.
    fn next(&mut self) -> Option<KeyEvent> {
        self.wait_next_key_event(self.iter_timeout)
    }

    /// Returns number of events currently queued for this `EventReg`.
    fn size_hint(&self) -> (usize, Option<usize>) {
        let reg_inner = self.reg_inner.lock().unwrap_or_else(mutex_poison);
        let event_queue_locked = reg_inner.event_queue.lock().unwrap_or_else(mutex_poison);

        (event_queue_locked.len(), Some(event_queue_locked.len()))
    } // reg_inner lock freed; event_queue lock freed.
}

impl EventRegInner {
    fn is_key_event_wanted(&self, event: &KeyEvent) -> bool {
        match event.key_position {
            KeyPosition::Down => mask_wants(&self.press_mask, event.key_index),
            KeyPosition::Up => mask_wants(&self.release_mask, event.key_index),
        }
    }

    /// Queue `key_event` if this registration wants it, and wake
    /// anyone waiting. `event_num` and `additional_events_still_queued`
    /// are filled in here.
    pub fn process_one_event(&mut self, mut key_event: KeyEvent) {
        if !self.is_key_event_wanted(&key_event) {
            return;
        }

        self.event_count += 1;
        {
            let mut circ_buf = self.event_queue.lock().unwrap_or_else(mutex_poison);

            // Make room if full.
            if circ_buf.len() >= self.queue_capacity {
                let _ = circ_buf.pop_front();
            }

            key_event.event_num = self.event_count;
            key_event.additional_events_still_queued = circ_buf.len() + 1;

            circ_buf.push_back(key_event);
        } // event_queue lock freed.

        // Wake any waiting sync subscriber, making room if necessary.
        if self.sync_sender.is_full() {
            let _ = self.sync_receiver.try_recv();
        }
        self.sync_sender
            .try_send(key_event.event_num)
            .unwrap_or_else(try_send_error);

        // Wake any waiting async subscriber. We hold a receiver
        // ourselves, so this can't fail.
        let _ = self.async_sender.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn event(key_index: usize, key_position: KeyPosition) -> KeyEvent {
        KeyEvent {
            row: 0,
            col: key_index as u8,
            key_index,
            velocity: 100,
            key_position,
            event_us: 0,
            event_num: 0,
            additional_events_still_queued: 0,
        }
    }

    fn registration(press_mask: Vec<bool>, release_mask: Vec<bool>, capacity: usize) -> EventReg {
        let (async_sender, async_receiver) = tokio::sync::watch::channel(());
        let (sync_sender, sync_receiver) = crossbeam_channel::bounded(1);
        EventReg {
            reg_inner: Arc::new(Mutex::new(EventRegInner {
                press_mask,
                release_mask,
                event_queue: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
                queue_capacity: capacity,
                async_sender,
                async_receiver,
                sync_sender,
                sync_receiver,
                event_count: 0,
            })),
            iter_timeout: Duration::from_millis(10),
            queue_capacity: capacity,
        }
    }

    fn feed(reg: &EventReg, key_event: KeyEvent) {
        reg.reg_inner
            .lock()
            .unwrap()
            .process_one_event(key_event);
    }

    #[test]
    fn masks_filter_and_number_events() {
        let mut reg = registration(vec![true, false, true], vec![false, true, true], 8);
        feed(&reg, event(0, KeyPosition::Down));
        feed(&reg, event(0, KeyPosition::Up));
        feed(&reg, event(1, KeyPosition::Down));
        feed(&reg, event(1, KeyPosition::Up));
        feed(&reg, event(2, KeyPosition::Down));
        feed(&reg, event(7, KeyPosition::Down));

        let events: Vec<(usize, KeyPosition, usize)> = std::iter::from_fn(|| reg.get_next_key_event())
            .map(|e| (e.key_index, e.key_position, e.event_num))
            .collect();
        assert_eq!(
            events,
            vec![
                (0, KeyPosition::Down, 1),
                (1, KeyPosition::Up, 2),
                (2, KeyPosition::Down, 3)
            ]
        );
        assert_eq!(reg.event_count(), 3);
    }

    #[test]
    fn oldest_dropped_when_full() {
        let mut reg = registration(vec![true; 4], vec![true; 4], 2);
        for key_index in 0..4 {
            feed(&reg, event(key_index, KeyPosition::Down));
        }
        let peeked = reg.peek_next_n_events(5).unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].key_index, 2);
        assert_eq!(peeked[1].additional_events_still_queued, 2);
        assert_eq!(reg.size_hint(), (2, Some(2)));

        reg.clear_queue();
        assert!(reg.peek_next_n_events(1).is_none());
    }

    #[test]
    fn masked_reads_leave_the_rest() {
        let mut reg = registration(vec![true; 4], vec![true; 4], 8);
        for key_index in [3, 1, 3, 2] {
            feed(&reg, event(key_index, KeyPosition::Down));
        }
        let only_three = [false, false, false, true];
        assert!(reg.get_next_n_events_masked(&only_three, 3).is_none());
        let threes = reg.get_next_n_events_masked(&only_three, 2).unwrap();
        assert_eq!(threes.iter().map(|e| e.event_num).collect::<Vec<_>>(), vec![1, 3]);

        let next = reg.get_next_key_event_masked(&[false, false, true]).unwrap();
        assert_eq!(next.key_index, 2);
        assert_eq!(reg.get_next_key_event().unwrap().key_index, 1);
        assert!(reg.get_next_key_event().is_none());
    }

    #[test]
    fn wait_times_out_then_wakes() {
        let mut reg = registration(vec![true; 2], vec![true; 2], 4);
        assert!(reg.wait_next_key_event(Duration::from_millis(5)).is_none());
        assert!(reg.next().is_none());

        let feeder = reg.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            feed(&feeder, event(1, KeyPosition::Up));
        });
        let waited = reg.wait_next_key_event(Duration::from_secs(5)).unwrap();
        assert_eq!(waited.key_index, 1);
        handle.join().unwrap();
    }
}
