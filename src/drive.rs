//! Merges the upstream replay stream with the locally deferred id set.
//!
//! Both sequences are individually sorted, so a single cursor over the
//! pending tracker is enough: deferred ids smaller than the incoming
//! upstream id are drained first, an id present in both is processed
//! once through the upstream path, and `finish` drains whatever is
//! left after the stream ends.

use crate::emit::Emitter;
use crate::middle::Member;
use crate::tags::Tags;
use anyhow::Result;

pub struct WayPass {
    next_deferred: Option<i64>,
}

impl WayPass {
    pub fn new(emitter: &mut Emitter) -> Result<WayPass> {
        Ok(WayPass {
            next_deferred: emitter.pop_pending_way()?,
        })
    }

    /// Upstream callback; ids must arrive in strictly ascending order.
    pub fn on_way(
        &mut self,
        emitter: &mut Emitter,
        id: i64,
        tags: &Tags,
        coords: &[(f64, f64)],
        exists: bool,
    ) -> Result<()> {
        self.drain_below(emitter, id, exists)?;
        if self.next_deferred == Some(id) {
            self.next_deferred = emitter.pop_pending_way()?;
        }
        if emitter.way_is_done(id) {
            return Ok(());
        }
        emitter.out_way(id, tags, coords, exists)
    }

    pub fn finish(&mut self, emitter: &mut Emitter, exists: bool) -> Result<()> {
        while let Some(next) = self.next_deferred {
            emitter.pending_way(next, exists)?;
            self.next_deferred = emitter.pop_pending_way()?;
        }
        Ok(())
    }

    fn drain_below(&mut self, emitter: &mut Emitter, limit: i64, exists: bool) -> Result<()> {
        while let Some(next) = self.next_deferred
            && next < limit
        {
            emitter.pending_way(next, exists)?;
            self.next_deferred = emitter.pop_pending_way()?;
        }
        Ok(())
    }
}

pub struct RelPass {
    next_deferred: Option<i64>,
}

impl RelPass {
    pub fn new(emitter: &mut Emitter) -> Result<RelPass> {
        Ok(RelPass {
            next_deferred: emitter.pop_pending_rel()?,
        })
    }

    pub fn on_relation(
        &mut self,
        emitter: &mut Emitter,
        id: i64,
        members: &[Member],
        tags: &Tags,
        exists: bool,
    ) -> Result<()> {
        self.drain_below(emitter, id, exists)?;
        if self.next_deferred == Some(id) {
            self.next_deferred = emitter.pop_pending_rel()?;
        }
        emitter.process_relation(id, members, tags, exists)
    }

    pub fn finish(&mut self, emitter: &mut Emitter, exists: bool) -> Result<()> {
        while let Some(next) = self.next_deferred {
            emitter.pending_relation(next, exists)?;
            self.next_deferred = emitter.pop_pending_rel()?;
        }
        Ok(())
    }

    fn drain_below(&mut self, emitter: &mut Emitter, limit: i64, exists: bool) -> Result<()> {
        while let Some(next) = self.next_deferred
            && next < limit
        {
            emitter.pending_relation(next, exists)?;
            self.next_deferred = emitter.pop_pending_rel()?;
        }
        Ok(())
    }
}
