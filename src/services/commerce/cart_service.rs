use crate::{
    entities::commerce::{cart, cart_item, product_variant, Cart, CartItem, CartModel, ProductVariant},
    errors::ServiceError,
    services::inventory,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Who a cart belongs to. A guest without a token gets a fresh cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartOwner {
    User(Uuid),
    Guest(Option<Uuid>),
}

/// One priced cart line
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Cart as shown to the shopper, priced at current variant prices
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub id: Uuid,
    pub items: Vec<CartLine>,
    pub items_count: i32,
    pub subtotal: Decimal,
    /// Set when this request created a guest cart; the caller stores it in the cookie
    #[serde(skip)]
    pub issued_guest_token: Option<Uuid>,
}

/// What a merge did, for logging and the merge endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub merged: usize,
    pub skipped_out_of_stock: usize,
    /// Variants deleted from the catalog since the guest added them
    pub skipped_unavailable: usize,
}

/// Cart store for users and guests.
///
/// Every quantity change locks the variant row before comparing against
/// stock, and quantities are capped at the stock available at that moment.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn get_or_create(&self, owner: CartOwner) -> Result<CartView, ServiceError> {
        let (cart, issued) = resolve_cart(&*self.db, owner).await?;
        let mut view = load_view(&*self.db, cart.id).await?;
        view.issued_guest_token = issued;
        Ok(view)
    }

    /// Adds one unit of `variant_id`, creating the line when missing.
    #[instrument(skip(self))]
    pub async fn add_item(&self, owner: CartOwner, variant_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let (cart, issued) = resolve_cart(&txn, owner).await?;
        let variant = inventory::lock_variant(&txn, variant_id).await?;
        if variant.stock <= 0 {
            return Err(ServiceError::InsufficientStock(variant.sku));
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let quantity = (item.quantity + 1).min(variant.stock);
                set_quantity(&txn, item, quantity).await?;
            }
            None => insert_line(&txn, cart.id, variant_id, 1).await?,
        }
        touch(&txn, cart).await?;
        txn.commit().await?;

        debug!(%variant_id, "item added to cart");
        self.view(owner, issued).await
    }

    #[instrument(skip(self))]
    pub async fn increment(&self, owner: CartOwner, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let (cart, issued) = resolve_cart(&txn, owner).await?;
        let item = find_line(&txn, cart.id, item_id).await?;
        let variant = inventory::lock_variant(&txn, item.variant_id).await?;
        if variant.stock <= 0 {
            return Err(ServiceError::InsufficientStock(variant.sku));
        }
        let quantity = (item.quantity + 1).min(variant.stock);
        set_quantity(&txn, item, quantity).await?;
        touch(&txn, cart).await?;
        txn.commit().await?;
        self.view(owner, issued).await
    }

    /// Removes one unit; the line is deleted when it would drop below one.
    #[instrument(skip(self))]
    pub async fn decrement(&self, owner: CartOwner, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let (cart, issued) = resolve_cart(&txn, owner).await?;
        let item = find_line(&txn, cart.id, item_id).await?;
        if item.quantity <= 1 {
            CartItem::delete_by_id(item.id).exec(&txn).await?;
        } else {
            let quantity = item.quantity - 1;
            set_quantity(&txn, item, quantity).await?;
        }
        touch(&txn, cart).await?;
        txn.commit().await?;
        self.view(owner, issued).await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, owner: CartOwner, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let (cart, issued) = resolve_cart(&txn, owner).await?;
        let item = find_line(&txn, cart.id, item_id).await?;
        CartItem::delete_by_id(item.id).exec(&txn).await?;
        touch(&txn, cart).await?;
        txn.commit().await?;
        self.view(owner, issued).await
    }

    /// Moves a guest cart into the user's cart.
    ///
    /// Out-of-stock and deleted variants are skipped and every merged quantity
    /// is capped at stock. The guest cart is deleted even when it had nothing
    /// to merge.
    #[instrument(skip(self))]
    pub async fn merge_guest_cart(
        &self,
        user_id: Uuid,
        guest_token: Uuid,
    ) -> Result<MergeSummary, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(guest_cart) = Cart::find()
            .filter(cart::Column::GuestToken.eq(guest_token))
            .one(&txn)
            .await?
        else {
            debug!("no guest cart to merge");
            return Ok(MergeSummary::default());
        };

        let user_cart = find_or_create_user_cart(&txn, user_id).await?;
        let guest_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(guest_cart.id))
            .order_by_asc(cart_item::Column::VariantId)
            .all(&txn)
            .await?;

        let mut summary = MergeSummary::default();
        for guest_item in guest_items {
            let variant = match inventory::lock_variant(&txn, guest_item.variant_id).await {
                Ok(variant) => variant,
                Err(ServiceError::NotFound(_)) => {
                    debug!(variant_id = %guest_item.variant_id, "guest item variant no longer exists");
                    summary.skipped_unavailable += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if variant.stock <= 0 {
                summary.skipped_out_of_stock += 1;
                continue;
            }

            let existing = CartItem::find()
                .filter(cart_item::Column::CartId.eq(user_cart.id))
                .filter(cart_item::Column::VariantId.eq(guest_item.variant_id))
                .one(&txn)
                .await?;
            match existing {
                Some(line) => {
                    let quantity = (line.quantity + guest_item.quantity).min(variant.stock);
                    set_quantity(&txn, line, quantity).await?;
                }
                None => {
                    let quantity = guest_item.quantity.min(variant.stock);
                    insert_line(&txn, user_cart.id, guest_item.variant_id, quantity).await?;
                }
            }
            summary.merged += 1;
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(guest_cart.id))
            .exec(&txn)
            .await?;
        Cart::delete_by_id(guest_cart.id).exec(&txn).await?;

        let mut user_cart: cart::ActiveModel = user_cart.into();
        user_cart.guest_token = Set(None);
        user_cart.updated_at = Set(Utc::now());
        user_cart.update(&txn).await?;

        txn.commit().await?;
        info!(
            %user_id,
            merged = summary.merged,
            skipped = summary.skipped_out_of_stock,
            unavailable = summary.skipped_unavailable,
            "guest cart merged"
        );
        Ok(summary)
    }

    /// Login path: a failed merge must not fail the login.
    pub async fn merge_guest_cart_best_effort(&self, user_id: Uuid, guest_token: Uuid) -> MergeSummary {
        match self.merge_guest_cart(user_id, guest_token).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(%user_id, error = %e, "guest cart merge failed");
                MergeSummary::default()
            }
        }
    }

    async fn view(&self, owner: CartOwner, issued: Option<Uuid>) -> Result<CartView, ServiceError> {
        let owner = match (owner, issued) {
            (CartOwner::Guest(_), Some(token)) => CartOwner::Guest(Some(token)),
            _ => owner,
        };
        let (cart, _) = resolve_cart(&*self.db, owner).await?;
        let mut view = load_view(&*self.db, cart.id).await?;
        view.issued_guest_token = issued;
        Ok(view)
    }
}

/// Finds the owner's cart or creates one. Returns the new guest token when one was issued.
async fn resolve_cart<C>(conn: &C, owner: CartOwner) -> Result<(CartModel, Option<Uuid>), ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
{
    match owner {
        CartOwner::User(user_id) => Ok((find_or_create_user_cart(conn, user_id).await?, None)),
        CartOwner::Guest(Some(token)) => {
            if let Some(cart) = Cart::find()
                .filter(cart::Column::GuestToken.eq(token))
                .one(conn)
                .await?
            {
                return Ok((cart, None));
            }
            let (cart, token) = create_guest_cart(conn).await?;
            Ok((cart, Some(token)))
        }
        CartOwner::Guest(None) => {
            let (cart, token) = create_guest_cart(conn).await?;
            Ok((cart, Some(token)))
        }
    }
}

async fn create_guest_cart<C: ConnectionTrait>(conn: &C) -> Result<(CartModel, Uuid), ServiceError> {
    let token = Uuid::new_v4();
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(None),
        guest_token: Set(Some(token)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    info!(cart_id = %cart.id, "guest cart created");
    Ok((cart, token))
}

/// Concurrent first accesses race on the unique `user_id`; the loser re-reads.
pub(crate) async fn find_or_create_user_cart<C>(conn: &C, user_id: Uuid) -> Result<CartModel, ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
{
    if let Some(cart) = Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?
    {
        return Ok(cart);
    }

    let now = Utc::now();
    let savepoint = conn.begin().await?;
    let inserted = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(Some(user_id)),
        guest_token: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&savepoint)
    .await;

    match inserted {
        Ok(cart) => {
            savepoint.commit().await?;
            Ok(cart)
        }
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            savepoint.rollback().await?;
            Cart::find()
                .filter(cart::Column::UserId.eq(user_id))
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::NotFound("cart".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    item_id: Uuid,
) -> Result<cart_item::Model, ServiceError> {
    CartItem::find_by_id(item_id)
        .filter(cart_item::Column::CartId.eq(cart_id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("cart item {}", item_id)))
}

async fn insert_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    cart_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        cart_id: Set(cart_id),
        variant_id: Set(variant_id),
        quantity: Set(quantity),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(())
}

async fn set_quantity<C: ConnectionTrait>(
    conn: &C,
    item: cart_item::Model,
    quantity: i32,
) -> Result<(), ServiceError> {
    if item.quantity == quantity {
        return Ok(());
    }
    let mut item: cart_item::ActiveModel = item.into();
    item.quantity = Set(quantity);
    item.updated_at = Set(Utc::now());
    item.update(conn).await?;
    Ok(())
}

async fn touch<C: ConnectionTrait>(conn: &C, cart: CartModel) -> Result<(), ServiceError> {
    let mut cart: cart::ActiveModel = cart.into();
    cart.updated_at = Set(Utc::now());
    cart.update(conn).await?;
    Ok(())
}

/// Cart lines joined with their variants, oldest line first.
pub(crate) async fn cart_lines<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<(cart_item::Model, product_variant::Model)>, ServiceError> {
    let rows = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .find_also_related(ProductVariant)
        .all(conn)
        .await?;

    rows.into_iter()
        .map(|(item, variant)| match variant {
            Some(variant) => Ok((item, variant)),
            None => Err(ServiceError::NotFound(format!("variant {}", item.variant_id))),
        })
        .collect()
}

async fn load_view<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<CartView, ServiceError> {
    let lines = cart_lines(conn, cart_id).await?;
    let items: Vec<CartLine> = lines
        .into_iter()
        .map(|(item, variant)| {
            let unit_price = variant.effective_price();
            CartLine {
                id: item.id,
                variant_id: item.variant_id,
                sku: variant.sku,
                quantity: item.quantity,
                unit_price,
                line_total: unit_price * Decimal::from(item.quantity),
            }
        })
        .collect();

    Ok(CartView {
        id: cart_id,
        items_count: items.iter().map(|l| l.quantity).sum(),
        subtotal: items.iter().map(|l| l.line_total).sum(),
        items,
        issued_guest_token: None,
    })
}
