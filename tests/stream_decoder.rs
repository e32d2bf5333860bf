mod common;

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::{stream, StreamExt};
    use teehee::api::models::{ChatSession, ChatSessionWithMessages, MessageContent, Role, StreamEvent};
    use teehee::api::stream::{decode_body, poll_message, BodyFormat, EventDecoder, PollSettings};
    use teehee::api::ApiError;

    use super::common::{base_time, message, partial};

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk(text.to_string())
    }

    #[test]
    fn test_body_format_from_content_type() {
        assert_eq!(
            BodyFormat::from_content_type(Some("text/event-stream; charset=utf-8")),
            Some(BodyFormat::EventStream)
        );
        assert_eq!(
            BodyFormat::from_content_type(Some("application/x-ndjson")),
            Some(BodyFormat::NdJson)
        );
        assert_eq!(
            BodyFormat::from_content_type(Some("text/plain")),
            Some(BodyFormat::RawText)
        );
        assert_eq!(BodyFormat::from_content_type(Some("application/json")), None);
        assert_eq!(BodyFormat::from_content_type(None), None);
    }

    #[test]
    fn test_sse_event_split_across_frames() {
        let mut decoder = EventDecoder::new(BodyFormat::EventStream);
        assert!(decoder
            .feed(b"data: {\"type\":\"chunk\",\"content\":\"Hel")
            .is_empty());
        assert_eq!(decoder.feed(b"lo\"}\n\n"), vec![chunk("Hello")]);
    }

    #[test]
    fn test_sse_done_marker_stops_decoding() {
        let mut decoder = EventDecoder::new(BodyFormat::EventStream);
        let events = decoder.feed(b"data: {\"type\":\"chunk\",\"content\":\"Hi\"}\n\ndata: [DONE]\n\ndata: late\n\n");
        assert_eq!(events, vec![chunk("Hi"), StreamEvent::Done(None)]);
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"data: more\n\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_sse_plain_and_multiline_data() {
        let mut decoder = EventDecoder::new(BodyFormat::EventStream);
        let events = decoder.feed(b": keep-alive\r\ndata: first\r\ndata: second\r\n\r\ndata: hi\n\n");
        assert_eq!(events, vec![chunk("first\nsecond"), chunk("hi")]);
    }

    #[test]
    fn test_sse_done_with_final_content() {
        let mut decoder = EventDecoder::new(BodyFormat::EventStream);
        let events = decoder.feed(b"data: {\"type\":\"done\",\"content\":\"Hi there!\"}\n\n");
        assert_eq!(
            events,
            vec![StreamEvent::Done(Some(MessageContent::from("Hi there!")))]
        );
    }

    #[test]
    fn test_sse_status_events_are_ignored() {
        let mut decoder = EventDecoder::new(BodyFormat::EventStream);
        let events = decoder.feed(b"data: {\"type\":\"status\",\"content\":\"thinking\"}\n\n");
        assert!(events.is_empty());
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_ndjson_chunks_and_error() {
        let mut decoder = EventDecoder::new(BodyFormat::NdJson);
        let events = decoder.feed(
            b"{\"type\":\"chunk\",\"content\":\"A\"}\n\nnot json\n{\"type\":\"error\",\"content\":\"boom\"}\n{\"type\":\"chunk\",\"content\":\"B\"}\n",
        );
        assert_eq!(events, vec![chunk("A"), StreamEvent::Error("boom".to_string())]);
    }

    #[test]
    fn test_ndjson_trailing_line_flushed_on_finish() {
        let mut decoder = EventDecoder::new(BodyFormat::NdJson);
        assert!(decoder.feed(b"{\"type\":\"chunk\",\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![chunk("tail")]);
    }

    #[test]
    fn test_raw_text_keeps_split_utf8_together() {
        let mut decoder = EventDecoder::new(BodyFormat::RawText);
        assert_eq!(decoder.feed(&[b'h', 0xC3]), vec![chunk("h")]);
        assert_eq!(decoder.feed(&[0xA9, b'!']), vec![chunk("é!")]);
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn test_decode_body_yields_events_in_order() {
        let frames: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"type\":\"chunk\",\"content\":\"Hi\"}\n".to_vec()),
            Ok(b"\ndata: {\"type\":\"chunk\",\"content\":\" there\"}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let events: Vec<_> = decode_body(stream::iter(frames), BodyFormat::EventStream)
            .collect()
            .await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(events, vec![chunk("Hi"), chunk(" there"), StreamEvent::Done(None)]);
    }

    #[tokio::test]
    async fn test_decode_body_transport_error_ends_stream() {
        let frames: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"Hel".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"lo".to_vec()),
        ];
        let events: Vec<_> = decode_body(stream::iter(frames), BodyFormat::RawText)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &chunk("Hel"));
        assert!(matches!(events[1], Err(ApiError::Network(_))));
    }

    fn thread_with(reply: teehee::api::models::Message) -> ChatSessionWithMessages {
        ChatSessionWithMessages {
            session: ChatSession {
                id: "chat-1".to_string(),
                name: None,
                user_id: "user-1".to_string(),
                root_message_id: None,
                created_at: base_time(),
            },
            messages: vec![message("u1", None, Role::User, "Hello"), reply],
        }
    }

    fn snapshot(text: &str, is_partial: bool) -> ChatSessionWithMessages {
        let mut reply = partial("a1", Some("u1"));
        reply.content = MessageContent::from(text);
        reply.is_partial = is_partial;
        thread_with(reply)
    }

    /// Serves snapshots in order, repeating the last one.
    fn scripted(
        snapshots: Vec<Result<ChatSessionWithMessages, ApiError>>,
    ) -> impl Fn() -> futures_util::future::Ready<Result<ChatSessionWithMessages, ApiError>> + Send + Sync + 'static
    {
        let queue = Arc::new(Mutex::new(VecDeque::from(snapshots)));
        move || {
            let mut queue = queue.lock().unwrap();
            let next = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                match queue.front().unwrap() {
                    Ok(thread) => Ok(thread.clone()),
                    Err(e) => Err(ApiError::Network(e.to_string())),
                }
            };
            futures_util::future::ready(next)
        }
    }

    fn fast() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            stall_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_polling_emits_new_suffixes_then_done() {
        let fetch = scripted(vec![
            Ok(snapshot("", true)),
            Ok(snapshot("He", true)),
            Ok(snapshot("He", true)),
            Ok(snapshot("Hello", true)),
            Ok(snapshot("Hello!", false)),
        ]);
        let events: Vec<StreamEvent> = poll_message(fetch, "a1".to_string(), fast())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                chunk("He"),
                chunk("llo"),
                chunk("!"),
                StreamEvent::Done(Some(MessageContent::from("Hello!"))),
            ]
        );
    }

    #[tokio::test]
    async fn test_polling_missing_message_is_not_found() {
        let mut gone = snapshot("", true);
        gone.messages.retain(|m| m.id != "a1");
        let fetch = scripted(vec![Ok(snapshot("Hi", true)), Ok(gone)]);

        let events: Vec<_> = poll_message(fetch, "a1".to_string(), fast()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &chunk("Hi"));
        assert!(matches!(events[1], Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_polling_gives_up_after_stall() {
        let fetch = scripted(vec![Ok(snapshot("", true))]);
        let settings = PollSettings {
            interval: Duration::from_millis(5),
            stall_timeout: Duration::from_millis(20),
        };

        let events: Vec<_> = poll_message(fetch, "a1".to_string(), settings).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ApiError::Network(_))));
    }

    #[tokio::test]
    async fn test_polling_diverged_but_changing_content_is_not_a_stall() {
        let mut snapshots = vec![Ok(snapshot("Hel", true))];
        for n in 1..=12 {
            snapshots.push(Ok(snapshot(&"X".repeat(n), true)));
        }
        snapshots.push(Ok(snapshot("Rewritten answer", false)));
        let fetch = scripted(snapshots);
        let settings = PollSettings {
            interval: Duration::from_millis(10),
            stall_timeout: Duration::from_millis(40),
        };

        let events: Vec<StreamEvent> = poll_message(fetch, "a1".to_string(), settings)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                chunk("Hel"),
                StreamEvent::Done(Some(MessageContent::from("Rewritten answer"))),
            ]
        );
    }
}
