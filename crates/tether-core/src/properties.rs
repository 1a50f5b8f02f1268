//! # properties 模块说明
//!
//! ## 角色定位（Why）
//! - 传输实现之间的差异（TLS 选项、原始套接字、会话信息）通过类型键查找暴露，
//!   而不是扩宽 [`Connection`](crate::Connection) 基础契约；
//! - 调用方以“查不到”表达“该能力不受支持”，探测可选特性无需继承层级。
//!
//! ## 契约（What）
//! - [`ConnectionProperties`] 在首次成功读取任意键之前可写，首次成功读取即冻结整个能力包，
//!   之后的 `add` 返回 [`ErrorKind::Configuration`](crate::ErrorKind::Configuration)；
//! - [`Extensions`] 为装饰器发布能力时使用的不可变映射，构造完成后只读。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::error::{ConnectionError, ErrorKind, Result, codes};

type Value = Arc<dyn Any + Send + Sync>;

/// 首次读取即冻结的能力包。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接选项在 `connect`/`listen` 调用时由各层装饰器按需读取，读取开始后再修改会导致
///   各层看到不一致的配置，因此首次成功读取后冻结。
///
/// ## 逻辑（How）
/// - 以 [`TypeId`] 为键、`Arc<dyn Any>` 为值；冻结位使用 [`AtomicBool`]，读取走 `&self`，
///   方便多个装饰器共享同一只读引用。
///
/// ## 注意事项（Trade-offs）
/// - 读取未命中不会冻结；[`contains`](Self::contains) 是显式的非冻结探测；
/// - 冻结前重复 `add` 同一类型会覆盖旧值。
#[derive(Default)]
pub struct ConnectionProperties {
    entries: HashMap<TypeId, Value>,
    frozen: AtomicBool,
}

impl ConnectionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一项能力，以值的类型为键。
    pub fn add<T>(&mut self, value: T) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        if self.is_frozen() {
            return Err(ConnectionError::new(
                ErrorKind::Configuration,
                codes::PROPERTIES_FROZEN,
                format!(
                    "connection properties are frozen; cannot add `{}`",
                    std::any::type_name::<T>()
                ),
            ));
        }
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        Ok(())
    }

    /// 构建器风格的 [`add`](Self::add)。
    pub fn with<T>(mut self, value: T) -> Result<Self>
    where
        T: Any + Send + Sync,
    {
        self.add(value)?;
        Ok(self)
    }

    /// 按类型读取能力；命中时冻结整个能力包。
    pub fn try_get<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        let value = self.entries.get(&TypeId::of::<T>())?.downcast_ref::<T>()?;
        self.frozen.store(true, Ordering::Release);
        Some(value)
    }

    /// 读取必需能力，缺失时返回配置错误。
    pub fn get<T>(&self) -> Result<&T>
    where
        T: Any + Send + Sync,
    {
        self.try_get::<T>()
            .ok_or_else(ConnectionError::missing_property::<T>)
    }

    /// 非冻结探测。
    pub fn contains<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Clone for ConnectionProperties {
    /// 克隆得到的能力包共享值，但拥有独立且未冻结的冻结位。
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            frozen: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("len", &self.entries.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// 装饰器发布的不可变能力集合。
#[derive(Clone, Default)]
pub struct Extensions {
    entries: HashMap<TypeId, Value>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// 以原始类型键查找，供 [`Connection::property`](crate::Connection::property) 使用。
    pub fn get_raw(&self, key: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        self.entries.get(&key).map(|value| value.as_ref())
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.get_raw(TypeId::of::<T>())?.downcast_ref::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Alpn(&'static str);

    #[derive(Debug, PartialEq)]
    struct Retries(u32);

    #[test]
    fn first_read_freezes_bag() {
        let mut props = ConnectionProperties::new();
        props.add(Alpn("h2")).expect("add before freeze");
        props.add(Retries(3)).expect("add before freeze");
        assert!(!props.is_frozen());

        assert_eq!(props.try_get::<Alpn>(), Some(&Alpn("h2")));
        assert!(props.is_frozen());

        let err = props.add(Retries(5)).expect_err("add after freeze fails");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.code(), codes::PROPERTIES_FROZEN);

        assert_eq!(props.try_get::<Alpn>(), Some(&Alpn("h2")));
        assert_eq!(props.try_get::<Retries>(), Some(&Retries(3)));
    }

    #[test]
    fn missing_reads_do_not_freeze() {
        let mut props = ConnectionProperties::new();
        assert!(props.try_get::<Alpn>().is_none());
        assert!(!props.contains::<Alpn>());
        assert!(!props.is_frozen());
        props.add(Alpn("http/1.1")).expect("still mutable");

        let err = props.get::<Retries>().expect_err("missing property");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.code(), codes::MISSING_PROPERTY);
    }

    #[test]
    fn extensions_lookup_by_type() {
        let ext = Extensions::new().with(Retries(1));
        assert_eq!(ext.get::<Retries>(), Some(&Retries(1)));
        assert!(ext.get_raw(TypeId::of::<Alpn>()).is_none());
    }
}
