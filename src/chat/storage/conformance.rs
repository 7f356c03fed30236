//! Behaviour every `ChatStore` backend must share.

use std::time::Duration;

use crate::chat::core::errors::ChatError;
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::message::{ChatMessage, MessageFilter, NewMessage, Role};
use crate::chat::storage::store::ChatStore;

fn new_message(conversation: i64, position: i64, role: Role, content: &str) -> NewMessage {
    NewMessage {
        message: ChatMessage::new(role, content),
        conversation_id: ConversationId::new(conversation),
        conversation_position: position,
        token_count: i64::try_from(content.split_whitespace().count()).unwrap_or(0),
    }
}

async fn put(
    store: &dyn ChatStore,
    conversation: i64,
    position: i64,
    role: Role,
    content: &str,
) -> MessageId {
    store
        .put_message(new_message(conversation, position, role, content))
        .await
        .unwrap()
}

/// Run every scenario against a freshly created, empty store.
pub async fn run_all(store: &dyn ChatStore) {
    store.create_schema().await.unwrap();
    conversations_and_ordering(store).await;
    positions_and_context(store).await;
    edits_and_deletes(store).await;
    search_and_filters(store).await;
    cascade_delete(store).await;
}

async fn conversations_and_ordering(store: &dyn ChatStore) {
    assert_eq!(store.max_conversation_id().await.unwrap(), ConversationId::new(0));
    assert!(store.list_conversations().await.unwrap().is_empty());

    store.put_conversation(ConversationId::new(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.put_conversation(ConversationId::new(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.put_conversation(ConversationId::new(3)).await.unwrap();
    assert!(matches!(
        store.put_conversation(ConversationId::new(2)).await,
        Err(ChatError::Validation(_))
    ));
    assert_eq!(store.max_conversation_id().await.unwrap(), ConversationId::new(3));

    let ids: Vec<i64> = store
        .list_conversations()
        .await
        .unwrap()
        .iter()
        .map(|c| c.id.get())
        .collect();
    assert_eq!(ids, vec![3, 2, 1]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    store.touch_conversation(ConversationId::new(1)).await.unwrap();
    let ids: Vec<i64> = store
        .list_conversations()
        .await
        .unwrap()
        .iter()
        .map(|c| c.id.get())
        .collect();
    assert_eq!(ids, vec![1, 3, 2]);

    let untitled = store
        .get_conversation_attributes(ConversationId::new(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untitled.title, None);

    store
        .update_conversation_title(ConversationId::new(2), "Trip planning".to_string())
        .await
        .unwrap();
    let titled = store
        .get_conversation_attributes(ConversationId::new(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(titled.title.as_deref(), Some("Trip planning"));

    assert!(
        store
            .get_conversation_attributes(ConversationId::new(99))
            .await
            .unwrap()
            .is_none()
    );
    store.touch_conversation(ConversationId::new(99)).await.unwrap();
    store
        .update_conversation_title(ConversationId::new(99), "ghost".to_string())
        .await
        .unwrap();
    assert_eq!(store.list_conversations().await.unwrap().len(), 3);
}

async fn positions_and_context(store: &dyn ChatStore) {
    let conversation = ConversationId::new(1);
    assert_eq!(store.next_position(conversation).await.unwrap(), 0);
    assert!(store.get_context(conversation).await.unwrap().is_empty());

    // Inserted out of order; reads come back by position.
    put(store, 1, 1, Role::Assistant, "Hi there").await;
    put(store, 1, 0, Role::User, "Hello").await;
    put(store, 1, 2, Role::User, "How are you").await;
    assert_eq!(store.next_position(conversation).await.unwrap(), 3);

    let context = store.get_context(conversation).await.unwrap();
    assert_eq!(
        context,
        vec![
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi there"),
            ChatMessage::user("How are you"),
        ]
    );

    let duplicate = store
        .put_message(new_message(1, 2, Role::User, "clash"))
        .await;
    assert!(matches!(duplicate, Err(ChatError::Validation(_))));
    assert_eq!(store.get_context(conversation).await.unwrap().len(), 3);
}

async fn edits_and_deletes(store: &dyn ChatStore) {
    let conversation = ConversationId::new(2);
    let first = put(store, 2, 0, Role::User, "Sample message one").await;
    let second = put(store, 2, 1, Role::Assistant, "Sample message two").await;
    let third = put(store, 2, 2, Role::User, "Sample message three").await;
    assert!(first < second && second < third);

    let updated = store
        .update_message_content(second, "Sample".to_string(), "Updated".to_string())
        .await
        .unwrap();
    assert!(updated);
    let record = store.get_message(second).await.unwrap().unwrap();
    assert_eq!(record.content, "Updated message two");
    assert_eq!(record.role, Role::Assistant);
    assert_eq!(record.conversation_position, 1);

    let missing = store
        .update_message_content(MessageId::new(9_999), "x".to_string(), "y".to_string())
        .await
        .unwrap();
    assert!(!missing);

    let invalid = store
        .update_message_content(first, "(unclosed".to_string(), "y".to_string())
        .await;
    assert!(matches!(invalid, Err(ChatError::InvalidPattern(_))));
    assert_eq!(
        store.get_message(first).await.unwrap().unwrap().content,
        "Sample message one"
    );

    store.delete_message(second).await.unwrap();
    store.delete_message(MessageId::new(9_999)).await.unwrap();
    assert!(store.get_message(second).await.unwrap().is_none());

    let positions: Vec<i64> = store
        .list_messages(MessageFilter::conversation(conversation))
        .await
        .unwrap()
        .iter()
        .map(|m| m.conversation_position)
        .collect();
    assert_eq!(positions, vec![0, 2]);
    assert_eq!(store.next_position(conversation).await.unwrap(), 3);
}

async fn search_and_filters(store: &dyn ChatStore) {
    put(store, 3, 0, Role::User, "a unique message").await;
    put(store, 3, 1, Role::Assistant, "plain reply").await;

    let found = store.find_messages("unique message".to_string()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conversation_id, ConversationId::new(3));

    assert!(
        store
            .find_messages("UNIQUE".to_string())
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        store
            .find_messages("no such text".to_string())
            .await
            .unwrap()
            .is_empty()
    );

    let all = store.list_messages(MessageFilter::all()).await.unwrap();
    let keys: Vec<(i64, i64)> = all
        .iter()
        .map(|m| (m.conversation_id.get(), m.conversation_position))
        .collect();
    assert_eq!(keys, vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 2), (3, 0), (3, 1)]);

    let assistants = store
        .list_messages(MessageFilter::all().with_role(Role::Assistant))
        .await
        .unwrap();
    assert!(assistants.iter().all(|m| m.role == Role::Assistant));
    assert_eq!(assistants.len(), 2);

    let narrowed = store
        .list_messages(MessageFilter::conversation(ConversationId::new(3)).with_role(Role::User))
        .await
        .unwrap();
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed[0].content, "a unique message");
}

async fn cascade_delete(store: &dyn ChatStore) {
    let conversation = ConversationId::new(3);
    let kept = store
        .list_messages(MessageFilter::conversation(ConversationId::new(1)))
        .await
        .unwrap();
    let doomed = store
        .list_messages(MessageFilter::conversation(conversation))
        .await
        .unwrap();

    store.delete_conversation(conversation).await.unwrap();
    store
        .delete_conversation(ConversationId::new(99))
        .await
        .unwrap();

    assert!(
        store
            .get_conversation_attributes(conversation)
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.get_context(conversation).await.unwrap().is_empty());
    for record in doomed {
        assert!(store.get_message(record.id).await.unwrap().is_none());
    }
    assert_eq!(
        store
            .list_messages(MessageFilter::conversation(ConversationId::new(1)))
            .await
            .unwrap(),
        kept
    );
    assert!(
        store
            .find_messages("unique message".to_string())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.max_conversation_id().await.unwrap(), ConversationId::new(2));
}
