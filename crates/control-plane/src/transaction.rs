//! 事务处理辅助宏

/// 在事务中执行 `$body`，错误类型固定为 [`portyo_common::DomainError`]。
///
/// # 示例
///
/// ```ignore
/// let model = txn!(&self.db, |txn| {
///     let existing = custom_domains::Entity::find()
///         .filter(custom_domains::Column::Domain.eq(&domain))
///         .one(txn)
///         .await?;
///     if existing.is_some() {
///         return Err(DomainError::DuplicateDomain(domain));
///     }
///     Ok(active.insert(txn).await?)
/// })?;
/// ```
#[macro_export]
macro_rules! txn {
    ($db:expr, |$txn:ident| $body:expr) => {{
        use sea_orm::TransactionTrait;
        $db.transaction::<_, _, portyo_common::DomainError>(|$txn| {
            Box::pin(async move { $body })
        })
        .await
    }};
}
