use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::session::Session;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug)]
struct Entry {
    session: SharedSession,
    last_active: Instant,
}

/// 内存中的会话表，进程退出即丢失
///
/// 同一会话内的操作通过会话锁串行执行，不同会话互不阻塞。
/// 设置了空闲超时时，超过时限未被访问的会话会被回收。
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Entry>>>,
    idle_timeout: Option<Duration>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: Arc::default(),
            idle_timeout,
        }
    }

    pub async fn create(&self, guideline: &str) -> SharedSession {
        self.evict_idle().await;

        let session = Session::new(guideline);
        let id = session.id;
        let shared = Arc::new(Mutex::new(session));
        let entry = Entry {
            session: shared.clone(),
            last_active: Instant::now(),
        };
        self.sessions.write().await.insert(id, entry);
        info!("[会话] 新建会话 {}", id);
        shared
    }

    /// 查找会话并刷新活跃时间，已过期的会话视为不存在
    pub async fn get(&self, id: &Uuid) -> Option<SharedSession> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(id)?;
        if self.is_expired(entry.last_active) {
            sessions.remove(id);
            info!("[会话] 会话 {} 已过期", id);
            return None;
        }
        entry.last_active = Instant::now();
        Some(entry.session.clone())
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("[会话] 结束会话 {}", id);
        }
        removed
    }

    /// 回收所有空闲超时的会话，返回回收数量
    pub async fn evict_idle(&self) -> usize {
        if self.idle_timeout.is_none() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| !self.is_expired(entry.last_active));
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("🧹 [会话] 回收 {} 个空闲会话，剩余 {} 个", evicted, sessions.len());
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn is_expired(&self, last_active: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| last_active.elapsed() >= timeout)
    }
}
