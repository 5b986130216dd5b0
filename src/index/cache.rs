//! LRU cache of open index resources
//!
//! Opening an index resource (files, searchers, writers) is expensive, so
//! open handles are kept in a bounded LRU cache and shared through
//! reference counting. The cache itself owns one reference to every
//! cached handle; eviction releases that reference, and the underlying
//! resource closes physically when the last holder lets go. A handle can
//! be marked stale, in which case `refresh` swaps a freshly opened handle
//! into the cache while readers of the old one finish undisturbed.

use crate::schema::IndexId;
use lru::LruCache;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// An openable and closable index resource held by the cache
pub trait HandleResource: Send + Sync {
    /// Physically close the resource. Called exactly once per handle,
    /// after the last reference is released.
    fn close(&self) -> CacheResult<()>;
}

/// Reference-counted wrapper around one open index resource.
///
/// The count starts at 1 for the cache's own reference. `acquire` adds a
/// reference and each guard releases one; the resource closes physically
/// when the count reaches zero.
pub struct IndexHandle<R> {
    id: IndexId,
    resource: R,
    read_only: bool,
    refs: AtomicUsize,
    stale: AtomicBool,
    detached: AtomicBool,
    closed: AtomicBool,
}

impl<R: HandleResource> IndexHandle<R> {
    fn new(id: IndexId, resource: R, read_only: bool) -> Self {
        IndexHandle {
            id,
            resource,
            read_only,
            refs: AtomicUsize::new(1),
            stale: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Read access to the resource
    pub fn searcher(&self) -> &R {
        &self.resource
    }

    /// Write access to the resource; refused in read-only mode
    pub fn writer(&self) -> CacheResult<&R> {
        if self.read_only {
            return Err(CacheError::Unsupported(
                "index writes are not supported in read only mode",
            ));
        }
        Ok(&self.resource)
    }

    /// Flag the handle as outdated so the next `refresh` replaces it
    pub fn set_stale(&self) -> CacheResult<()> {
        if self.read_only {
            return Err(CacheError::Unsupported(
                "marking an index stale is not supported in read only mode",
            ));
        }
        self.stale.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Atomically read and clear the stale flag
    pub fn check_and_clear_stale(&self) -> bool {
        self.stale.swap(false, Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Take another reference. Fails once the handle is fully closed.
    fn acquire(&self) -> bool {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one reference; physically closes the resource when the
    /// last one goes. Returns whether this call closed the resource.
    fn release(&self) -> CacheResult<bool> {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "handle released more often than acquired");
        if previous == 1 {
            // close exactly once even if callers race here
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.resource.close()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop the cache's own reference. Existing holders keep the handle
    /// alive; the resource closes when the last of them finishes.
    fn detach_or_close(&self) -> CacheResult<bool> {
        self.detached.store(true, Ordering::SeqCst);
        self.release()
    }
}

/// RAII reference to a cached handle. Each guard holds exactly one
/// reference and releases it exactly once, through [`HandleGuard::close`]
/// or on drop, whichever comes first.
pub struct HandleGuard<R: HandleResource> {
    handle: Arc<IndexHandle<R>>,
    released: bool,
}

impl<R: HandleResource> HandleGuard<R> {
    pub fn handle(&self) -> &IndexHandle<R> {
        &self.handle
    }

    /// Release this guard's reference eagerly. Returns whether the
    /// resource physically closed as a result.
    pub fn close(mut self) -> CacheResult<bool> {
        self.released = true;
        self.handle.release()
    }
}

impl<R: HandleResource> std::ops::Deref for HandleGuard<R> {
    type Target = IndexHandle<R>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<R: HandleResource> Drop for HandleGuard<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.handle.release() {
            warn!("failed to close handle for index {}: {}", self.handle.id, e);
        }
    }
}

/// Cache sizing and mode
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    pub read_only: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: NonZeroUsize::new(128).unwrap(),
            read_only: false,
        }
    }
}

type Opener<R> = Box<dyn Fn(IndexId) -> CacheResult<R> + Send + Sync>;

/// Bounded cache of open index handles, keyed by index id
pub struct HandleCache<R: HandleResource> {
    config: CacheConfig,
    opener: Opener<R>,
    handles: Mutex<LruCache<IndexId, Arc<IndexHandle<R>>>>,
}

impl<R: HandleResource> HandleCache<R> {
    pub fn new(
        config: CacheConfig,
        opener: impl Fn(IndexId) -> CacheResult<R> + Send + Sync + 'static,
    ) -> Self {
        HandleCache {
            handles: Mutex::new(LruCache::new(config.capacity)),
            config,
            opener: Box::new(opener),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Number of handles currently cached
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().unwrap().len() == 0
    }

    /// Borrow the handle for an index, opening it on miss. The returned
    /// guard keeps the resource alive until dropped, even across an
    /// eviction or delete in the meantime.
    pub fn get(&self, id: IndexId) -> CacheResult<HandleGuard<R>> {
        if let Some(guard) = self.cached(id) {
            return Ok(guard);
        }

        // open outside the lock; a slow open of one index must not stall
        // lookups of every other id
        let resource = (self.opener)(id)?;
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get(&id) {
            // another thread opened the same index while we did
            if handle.acquire() {
                let handle = handle.clone();
                drop(handles);
                resource.close()?;
                return Ok(HandleGuard {
                    handle,
                    released: false,
                });
            }
            handles.pop(&id);
        }
        let handle = Arc::new(IndexHandle::new(id, resource, self.config.read_only));
        handle.acquire();
        debug!("opened handle for index {}", id);
        let evicted = handles.push(id, handle.clone());
        drop(handles);
        if let Some((evicted_id, evicted)) = evicted {
            if evicted_id != id {
                debug!("evicting handle for index {}", evicted_id);
                evicted.detach_or_close()?;
            }
        }
        Ok(HandleGuard {
            handle,
            released: false,
        })
    }

    fn cached(&self, id: IndexId) -> Option<HandleGuard<R>> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get(&id)?.clone();
        if handle.acquire() {
            Some(HandleGuard {
                handle,
                released: false,
            })
        } else {
            // fully closed under us; the caller reopens
            handles.pop(&id);
            None
        }
    }

    /// Exchange a guard on a stale handle for a guard on a fresh one.
    /// Without the stale flag set (and always in read-only mode) the
    /// guard comes back unchanged. The old handle stays open for its
    /// remaining holders and closes when they finish.
    pub fn refresh(&self, guard: HandleGuard<R>) -> CacheResult<HandleGuard<R>> {
        if self.config.read_only || !guard.handle.check_and_clear_stale() {
            return Ok(guard);
        }
        let id = guard.handle.id;
        let resource = (self.opener)(id)?;
        let handle = Arc::new(IndexHandle::new(id, resource, self.config.read_only));
        handle.acquire();
        debug!("refreshed handle for index {}", id);

        let mut handles = self.handles.lock().unwrap();
        let replaced = handles.push(id, handle.clone());
        drop(handles);
        if let Some((_, old)) = replaced {
            // the cache's reference to the replaced (or evicted) handle;
            // the caller's reference to the stale one goes with the guard
            old.detach_or_close()?;
        }
        drop(guard);
        Ok(HandleGuard {
            handle,
            released: false,
        })
    }

    /// Drop an index's handle from the cache. Outstanding guards keep
    /// the resource open until they finish.
    pub fn delete(&self, id: IndexId) -> CacheResult<()> {
        if self.config.read_only {
            return Err(CacheError::IllegalState(
                "deletion in read only mode is not supported".to_string(),
            ));
        }
        let removed = self.handles.lock().unwrap().pop(&id);
        if let Some(handle) = removed {
            handle.detach_or_close()?;
        }
        Ok(())
    }

    /// Mark a cached handle stale; a miss is a no-op
    pub fn set_stale(&self, id: IndexId) -> CacheResult<()> {
        let handle = self.handles.lock().unwrap().peek(&id).cloned();
        if let Some(handle) = handle {
            handle.set_stale()?;
        }
        Ok(())
    }

    /// Release every cached handle. Outstanding guards still close their
    /// resources when dropped.
    pub fn close_all(&self) -> CacheResult<()> {
        let mut handles = self.handles.lock().unwrap();
        while let Some((_, handle)) = handles.pop_lru() {
            handle.detach_or_close()?;
        }
        Ok(())
    }
}
