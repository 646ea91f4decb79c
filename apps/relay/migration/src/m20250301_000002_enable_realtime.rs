use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Row level security and publications only exist on Postgres.
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let setup_sql = r#"
        ALTER TABLE messages ENABLE ROW LEVEL SECURITY;

        DROP POLICY IF EXISTS "messages are publicly readable" ON messages;
        CREATE POLICY "messages are publicly readable" ON messages FOR SELECT USING (true);

        DO $$
        BEGIN
            IF EXISTS (SELECT 1 FROM pg_publication WHERE pubname = 'supabase_realtime')
               AND NOT EXISTS (
                   SELECT 1 FROM pg_publication_tables
                   WHERE pubname = 'supabase_realtime' AND tablename = 'messages'
               )
            THEN
                ALTER PUBLICATION supabase_realtime ADD TABLE messages;
            END IF;
        END $$;
        "#;

        manager
            .get_connection()
            .execute_unprepared(setup_sql)
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let teardown_sql = r#"
        DO $$
        BEGIN
            IF EXISTS (
                SELECT 1 FROM pg_publication_tables
                WHERE pubname = 'supabase_realtime' AND tablename = 'messages'
            )
            THEN
                ALTER PUBLICATION supabase_realtime DROP TABLE messages;
            END IF;
        END $$;

        DROP POLICY IF EXISTS "messages are publicly readable" ON messages;
        ALTER TABLE messages DISABLE ROW LEVEL SECURITY;
        "#;

        manager
            .get_connection()
            .execute_unprepared(teardown_sql)
            .await?;

        Ok(())
    }
}
