//! 账户认证
//!
//! 握手中的用户名/密码经由 `AccountStore` 解析为租户 ID。数据库
//! 后端不在本服务范围内，默认实现把任何凭据映射到单一租户。

/// 账户存储接口
pub trait AccountStore: Send + Sync {
    /// 认证成功返回租户 ID，失败返回 None
    fn authenticate(&self, user: &str, passwd: &str) -> Option<u32>;
}

/// 单租户存储：接受任何凭据
pub struct SingleUserStore {
    pub user_id: u32,
}

impl Default for SingleUserStore {
    fn default() -> Self {
        Self { user_id: 1 }
    }
}

impl AccountStore for SingleUserStore {
    fn authenticate(&self, _user: &str, _passwd: &str) -> Option<u32> {
        Some(self.user_id)
    }
}
