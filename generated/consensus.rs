// ---------- Log records ----------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpIdPb {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(int64, tag = "2")]
    pub index: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequestPb {
    #[prost(bytes = "vec", tag = "1")]
    pub client_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "2")]
    pub request_id: i64,
    #[prost(int64, tag = "3")]
    pub min_running_request_id: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub write_batch: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateMsg {
    #[prost(message, optional, tag = "1")]
    pub id: ::core::option::Option<OpIdPb>,
    #[prost(enumeration = "OperationType", tag = "2")]
    pub op_type: i32,
    #[prost(fixed64, tag = "3")]
    pub hybrid_time: u64,
    /// Absent when the writer did not know of any committed op.
    #[prost(message, optional, tag = "4")]
    pub committed_op_id: ::core::option::Option<OpIdPb>,
    #[prost(message, optional, tag = "5")]
    pub write_request: ::core::option::Option<WriteRequestPb>,
    /// Opaque body for config changes.
    #[prost(bytes = "vec", tag = "6")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntryPb {
    #[prost(enumeration = "LogEntryType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub replicate: ::core::option::Option<ReplicateMsg>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntryBatchPb {
    #[prost(message, repeated, tag = "1")]
    pub entry: ::prost::alloc::vec::Vec<LogEntryPb>,
    #[prost(message, optional, tag = "2")]
    pub committed_op_id: ::core::option::Option<OpIdPb>,
    #[prost(uint64, tag = "3")]
    pub mono_time: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogSegmentHeaderPb {
    #[prost(uint32, tag = "1")]
    pub major_version: u32,
    #[prost(uint32, tag = "2")]
    pub minor_version: u32,
    #[prost(int64, tag = "3")]
    pub sequence_number: i64,
    #[prost(string, tag = "4")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "5")]
    pub schema: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "6")]
    pub schema_version: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogSegmentFooterPb {
    #[prost(int64, tag = "1")]
    pub num_entries: i64,
    /// -1 when the segment holds no replicate entries.
    #[prost(int64, tag = "2")]
    pub min_replicate_index: i64,
    #[prost(int64, tag = "3")]
    pub max_replicate_index: i64,
    /// 0 when unknown (footer rebuilt by scanning).
    #[prost(int64, tag = "4")]
    pub close_timestamp_micros: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TermPb {
    #[prost(int64, tag = "1")]
    pub term: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusRequestPb {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub caller_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub dest_uuid: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub caller_term: i64,
    #[prost(message, optional, tag = "5")]
    pub preceding_id: ::core::option::Option<OpIdPb>,
    #[prost(message, optional, tag = "6")]
    pub committed_op_id: ::core::option::Option<OpIdPb>,
    #[prost(message, repeated, tag = "7")]
    pub ops: ::prost::alloc::vec::Vec<ReplicateMsg>,
    /// 0 means no lease is granted with this request.
    #[prost(uint64, tag = "8")]
    pub leader_lease_duration_ms: u64,
    #[prost(uint64, tag = "9")]
    pub ht_lease_expiration: u64,
    #[prost(fixed64, tag = "10")]
    pub propagated_hybrid_time: u64,
    /// 0 means not propagated.
    #[prost(fixed64, tag = "11")]
    pub propagated_safe_time: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusErrorPb {
    #[prost(enumeration = "ConsensusErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusStatusPb {
    #[prost(message, optional, tag = "1")]
    pub last_received: ::core::option::Option<OpIdPb>,
    #[prost(message, optional, tag = "2")]
    pub last_received_current_leader: ::core::option::Option<OpIdPb>,
    #[prost(int64, tag = "3")]
    pub last_committed_idx: i64,
    #[prost(message, optional, tag = "4")]
    pub last_applied: ::core::option::Option<OpIdPb>,
    #[prost(message, optional, tag = "5")]
    pub error: ::core::option::Option<ConsensusErrorPb>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletServerErrorPb {
    #[prost(enumeration = "TabletErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusResponsePb {
    #[prost(string, tag = "1")]
    pub responder_uuid: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub responder_term: ::core::option::Option<TermPb>,
    #[prost(message, optional, tag = "3")]
    pub status: ::core::option::Option<ConsensusStatusPb>,
    #[prost(message, optional, tag = "4")]
    pub error: ::core::option::Option<TabletServerErrorPb>,
    #[prost(uint64, tag = "5")]
    pub num_sst_files: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRemoteBootstrapRequestPb {
    #[prost(string, tag = "1")]
    pub dest_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub bootstrap_peer_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub bootstrap_peer_addr: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub caller_term: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRemoteBootstrapResponsePb {}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationType {
    UnknownOp = 0,
    NoOp = 1,
    WriteOp = 2,
    ChangeConfigOp = 3,
}
// ---------- WAL segments ----------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogEntryType {
    UnknownEntry = 0,
    Replicate = 1,
    FlushMarker = 2,
}
// ---------- Replication RPC ----------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MemberType {
    UnknownMemberType = 0,
    Voter = 1,
    Observer = 2,
    PreVoter = 3,
    PreObserver = 4,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConsensusErrorCode {
    UnknownConsensusError = 0,
    PrecedingEntryDidntMatch = 1,
    InvalidTerm = 2,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TabletErrorCode {
    UnknownTabletError = 0,
    TabletNotFound = 1,
}
#[doc = r" Generated client implementations."]
pub mod consensus_service_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    pub struct ConsensusServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl ConsensusServiceClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> ConsensusServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn update_consensus(
            &mut self,
            request: impl tonic::IntoRequest<super::ConsensusRequestPb>,
        ) -> Result<tonic::Response<super::ConsensusResponsePb>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/consensus.ConsensusService/UpdateConsensus");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn start_remote_bootstrap(
            &mut self,
            request: impl tonic::IntoRequest<super::StartRemoteBootstrapRequestPb>,
        ) -> Result<tonic::Response<super::StartRemoteBootstrapResponsePb>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/consensus.ConsensusService/StartRemoteBootstrap",
            );
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for ConsensusServiceClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for ConsensusServiceClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "ConsensusServiceClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod consensus_service_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with ConsensusServiceServer."]
    #[async_trait]
    pub trait ConsensusService: Send + Sync + 'static {
        async fn update_consensus(
            &self,
            request: tonic::Request<super::ConsensusRequestPb>,
        ) -> Result<tonic::Response<super::ConsensusResponsePb>, tonic::Status>;
        async fn start_remote_bootstrap(
            &self,
            request: tonic::Request<super::StartRemoteBootstrapRequestPb>,
        ) -> Result<tonic::Response<super::StartRemoteBootstrapResponsePb>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct ConsensusServiceServer<T: ConsensusService> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: ConsensusService> ConsensusServiceServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for ConsensusServiceServer<T>
    where
        T: ConsensusService,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/consensus.ConsensusService/UpdateConsensus" => {
                    #[allow(non_camel_case_types)]
                    struct UpdateConsensusSvc<T: ConsensusService>(pub Arc<T>);
                    impl<T: ConsensusService> tonic::server::UnaryService<super::ConsensusRequestPb>
                        for UpdateConsensusSvc<T>
                    {
                        type Response = super::ConsensusResponsePb;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ConsensusRequestPb>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).update_consensus(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = UpdateConsensusSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/consensus.ConsensusService/StartRemoteBootstrap" => {
                    #[allow(non_camel_case_types)]
                    struct StartRemoteBootstrapSvc<T: ConsensusService>(pub Arc<T>);
                    impl<T: ConsensusService>
                        tonic::server::UnaryService<super::StartRemoteBootstrapRequestPb>
                        for StartRemoteBootstrapSvc<T>
                    {
                        type Response = super::StartRemoteBootstrapResponsePb;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::StartRemoteBootstrapRequestPb>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).start_remote_bootstrap(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = StartRemoteBootstrapSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: ConsensusService> Clone for ConsensusServiceServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: ConsensusService> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: ConsensusService> tonic::transport::NamedService for ConsensusServiceServer<T> {
        const NAME: &'static str = "consensus.ConsensusService";
    }
}
