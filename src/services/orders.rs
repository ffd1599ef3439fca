use crate::{
    entities::{invoice, order, order_item, payment},
    errors::ServiceError,
    services::pricing::{compute_vendor_totals, taxes::active_taxes, VendorTotals},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

impl ListQuery {
    fn resolve(&self) -> (u64, u64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }
}

/// Order with its lines, payment and invoice
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: Option<payment::Model>,
    pub invoice: Option<invoice::Model>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderDetail>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// An order as one vendor sees it: only that vendor's lines and share
#[derive(Debug, Clone, Serialize)]
pub struct VendorOrder {
    pub order_id: Uuid,
    pub status: order::OrderStatus,
    pub created_at: DateTime<Utc>,
    pub items: Vec<order_item::Model>,
    pub totals: VendorTotals,
}

/// Read side of orders and invoices
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Newest first.
    #[instrument(skip(self))]
    pub async fn my_orders(&self, user_id: Uuid, query: ListQuery) -> Result<OrderListResponse, ServiceError> {
        let (page, per_page) = query.resolve();
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;
        let orders = self.attach_details(orders).await?;

        info!(total, page, returned = orders.len(), "orders listed");
        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Orders of other users read as missing.
    #[instrument(skip(self))]
    pub async fn order_detail(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        self.attach_details(vec![order])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn my_invoices(&self, user_id: Uuid) -> Result<Vec<invoice::Model>, ServiceError> {
        Ok(invoice::Entity::find()
            .inner_join(order::Entity)
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(invoice::Column::Sequence)
            .all(&*self.db)
            .await?)
    }

    /// Orders containing at least one of the vendor's items, newest first.
    #[instrument(skip(self))]
    pub async fn vendor_orders(&self, vendor_id: Uuid) -> Result<Vec<VendorOrder>, ServiceError> {
        let order_ids: Vec<Uuid> = order_item::Entity::find()
            .select_only()
            .column(order_item::Column::OrderId)
            .filter(order_item::Column::VendorId.eq(vendor_id))
            .distinct()
            .into_tuple()
            .all(&*self.db)
            .await?;
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }

        let orders = order::Entity::find()
            .filter(order::Column::Id.is_in(order_ids))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        self.vendor_views(vendor_id, orders).await
    }

    #[instrument(skip(self))]
    pub async fn vendor_order(&self, vendor_id: Uuid, order_id: Uuid) -> Result<VendorOrder, ServiceError> {
        let not_found = || ServiceError::NotFound(format!("order {}", order_id));
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(not_found)?;

        let views = self.vendor_views(vendor_id, vec![order]).await?;
        views
            .into_iter()
            .find(|v| !v.items.is_empty())
            .ok_or_else(not_found)
    }

    async fn vendor_views(
        &self,
        vendor_id: Uuid,
        orders: Vec<order::Model>,
    ) -> Result<Vec<VendorOrder>, ServiceError> {
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items = group_by_order(
            order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .all(&*self.db)
                .await?,
            |i| i.order_id,
        );
        let taxes = active_taxes(&*self.db).await?;

        Ok(orders
            .into_iter()
            .map(|order| {
                let all_items = items.remove(&order.id).unwrap_or_default();
                let totals = compute_vendor_totals(&order, &all_items, vendor_id, &taxes);
                VendorOrder {
                    order_id: order.id,
                    status: order.status,
                    created_at: order.created_at,
                    items: all_items
                        .into_iter()
                        .filter(|i| i.vendor_id == vendor_id)
                        .collect(),
                    totals,
                }
            })
            .collect())
    }

    async fn attach_details(&self, orders: Vec<order::Model>) -> Result<Vec<OrderDetail>, ServiceError> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();

        let mut items = group_by_order(
            order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(ids.clone()))
                .all(&*self.db)
                .await?,
            |i| i.order_id,
        );
        let mut payments: HashMap<Uuid, payment::Model> = payment::Entity::find()
            .filter(payment::Column::OrderId.is_in(ids.clone()))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.order_id, p))
            .collect();
        let mut invoices: HashMap<Uuid, invoice::Model> = invoice::Entity::find()
            .filter(invoice::Column::OrderId.is_in(ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|i| (i.order_id, i))
            .collect();

        Ok(orders
            .into_iter()
            .map(|order| OrderDetail {
                items: items.remove(&order.id).unwrap_or_default(),
                payment: payments.remove(&order.id),
                invoice: invoices.remove(&order.id),
                order,
            })
            .collect())
    }
}

fn group_by_order<T>(rows: Vec<T>, key: impl Fn(&T) -> Uuid) -> HashMap<Uuid, Vec<T>> {
    let mut grouped: HashMap<Uuid, Vec<T>> = HashMap::new();
    for row in rows {
        grouped.entry(key(&row)).or_default().push(row);
    }
    grouped
}
