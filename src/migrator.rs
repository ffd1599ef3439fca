use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_catalog_tables::Migration),
            Box::new(m20240301_000002_create_pricing_tables::Migration),
            Box::new(m20240301_000003_create_shipping_addresses_table::Migration),
            Box::new(m20240301_000004_create_cart_tables::Migration),
            Box::new(m20240301_000005_create_order_tables::Migration),
            Box::new(m20240301_000006_create_payments_table::Migration),
            Box::new(m20240301_000007_create_invoices_table::Migration),
        ]
    }
}

mod m20240301_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::VendorId).uuid().not_null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Slug).string().not_null())
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_vendor_id")
                        .table(Products::Table)
                        .col(Products::VendorId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductVariants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductVariants::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductVariants::ProductId).uuid().not_null())
                        .col(ColumnDef::new(ProductVariants::Sku).string().not_null())
                        .col(
                            ColumnDef::new(ProductVariants::Price)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::DiscountedPrice)
                                .decimal()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::Stock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::IsDefault)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_variants_product_id")
                                .from(ProductVariants::Table, ProductVariants::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_product_variants_sku")
                        .table(ProductVariants::Table)
                        .col(ProductVariants::Sku)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductVariants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        VendorId,
        Name,
        Slug,
        IsActive,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ProductVariants {
        Table,
        Id,
        ProductId,
        Sku,
        Price,
        DiscountedPrice,
        Stock,
        IsDefault,
        UpdatedAt,
    }
}

mod m20240301_000002_create_pricing_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_pricing_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Coupons::Code).string().not_null())
                        .col(ColumnDef::new(Coupons::DiscountType).string_len(20).not_null())
                        .col(ColumnDef::new(Coupons::Value).decimal().not_null())
                        .col(
                            ColumnDef::new(Coupons::ValidFrom)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::ValidTo)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::MinOrderAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Coupons::FirstOrderOnly)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Coupons::IsPublic)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Coupons::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(Coupons::MaxUses).integer().null())
                        .col(
                            ColumnDef::new(Coupons::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Taxes::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Taxes::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Taxes::Name).string().not_null())
                        .col(ColumnDef::new(Taxes::TaxType).string_len(20).not_null())
                        .col(ColumnDef::new(Taxes::Value).decimal().not_null())
                        .col(
                            ColumnDef::new(Taxes::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Taxes::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Coupons {
        Table,
        Id,
        Code,
        DiscountType,
        Value,
        ValidFrom,
        ValidTo,
        MinOrderAmount,
        FirstOrderOnly,
        IsPublic,
        IsActive,
        MaxUses,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Taxes {
        Table,
        Id,
        Name,
        TaxType,
        Value,
        IsActive,
    }
}

mod m20240301_000003_create_shipping_addresses_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_shipping_addresses_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ShippingAddresses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingAddresses::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShippingAddresses::UserId).uuid().not_null())
                        .col(ColumnDef::new(ShippingAddresses::FullName).string().not_null())
                        .col(
                            ColumnDef::new(ShippingAddresses::PhoneNumber)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingAddresses::AddressLine1)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShippingAddresses::AddressLine2).string().null())
                        .col(ColumnDef::new(ShippingAddresses::City).string().not_null())
                        .col(ColumnDef::new(ShippingAddresses::State).string().null())
                        .col(ColumnDef::new(ShippingAddresses::PostalCode).string().null())
                        .col(ColumnDef::new(ShippingAddresses::Country).string().not_null())
                        .col(ColumnDef::new(ShippingAddresses::Instructions).text().null())
                        .col(
                            ColumnDef::new(ShippingAddresses::IsDefault)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(ShippingAddresses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_shipping_addresses_user_id")
                        .table(ShippingAddresses::Table)
                        .col(ShippingAddresses::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ShippingAddresses::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ShippingAddresses {
        Table,
        Id,
        UserId,
        FullName,
        PhoneNumber,
        #[sea_orm(iden = "address_line_1")]
        AddressLine1,
        #[sea_orm(iden = "address_line_2")]
        AddressLine2,
        City,
        State,
        PostalCode,
        Country,
        Instructions,
        IsDefault,
        CreatedAt,
    }
}

mod m20240301_000004_create_cart_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Carts::UserId).uuid().null())
                        .col(ColumnDef::new(Carts::GuestToken).uuid().null())
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_user_id")
                        .table(Carts::Table)
                        .col(Carts::UserId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_guest_token")
                        .table(Carts::Table)
                        .col(Carts::GuestToken)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart_id")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_variant_id")
                                .from(CartItems::Table, CartItems::VariantId)
                                .to(ProductVariants::Table, ProductVariants::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_variant")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .col(CartItems::VariantId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        UserId,
        GuestToken,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        CartId,
        VariantId,
        Quantity,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProductVariants {
        Table,
        Id,
    }
}

mod m20240301_000005_create_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ShippingAddressId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::Subtotal).decimal().not_null())
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalTax)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::GrandTotal).decimal().not_null())
                        .col(ColumnDef::new(Orders::CouponCode).string().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_orders_shipping_address_id")
                                .from(Orders::Table, Orders::ShippingAddressId)
                                .to(ShippingAddresses::Table, ShippingAddresses::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VendorId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Sku).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_vendor_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::VendorId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        UserId,
        ShippingAddressId,
        Status,
        Subtotal,
        DiscountAmount,
        TotalTax,
        GrandTotal,
        CouponCode,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        VariantId,
        VendorId,
        Sku,
        Quantity,
        UnitPrice,
    }

    #[derive(DeriveIden)]
    enum ShippingAddresses {
        Table,
        Id,
    }
}

mod m20240301_000006_create_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::Provider).string().null())
                        .col(ColumnDef::new(Payments::Amount).decimal().not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::GatewayOrderId).string().null())
                        .col(ColumnDef::new(Payments::TransactionId).string().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_id")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_gateway_order_id")
                        .table(Payments::Table)
                        .col(Payments::GatewayOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_transaction_id")
                        .table(Payments::Table)
                        .col(Payments::TransactionId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Method,
        Provider,
        Amount,
        Status,
        GatewayOrderId,
        TransactionId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }
}

mod m20240301_000007_create_invoices_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000007_create_invoices_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Invoices::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Invoices::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Invoices::InvoiceNumber).string().not_null())
                        .col(ColumnDef::new(Invoices::Sequence).big_integer().not_null())
                        .col(ColumnDef::new(Invoices::BillingAddress).text().not_null())
                        .col(ColumnDef::new(Invoices::Subtotal).decimal().not_null())
                        .col(
                            ColumnDef::new(Invoices::DiscountAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Invoices::TaxAmount).decimal().not_null())
                        .col(ColumnDef::new(Invoices::Total).decimal().not_null())
                        .col(ColumnDef::new(Invoices::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Invoices::IssuedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::DueDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_order_id")
                                .from(Invoices::Table, Invoices::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // The unique order_id index backs the once-per-order issuance guard.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_order_id")
                        .table(Invoices::Table)
                        .col(Invoices::OrderId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_invoice_number")
                        .table(Invoices::Table)
                        .col(Invoices::InvoiceNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_sequence")
                        .table(Invoices::Table)
                        .col(Invoices::Sequence)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Invoices::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Invoices {
        Table,
        Id,
        OrderId,
        InvoiceNumber,
        Sequence,
        BillingAddress,
        Subtotal,
        DiscountAmount,
        TaxAmount,
        Total,
        Status,
        IssuedAt,
        DueDate,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }
}
