//! Counter names shared between the providers, the aggregator and the diagnostic engine.

pub const STATE: &str = "State";
pub const CA_STATE: &str = "CAState";
pub const CUR_MSS: &str = "CurMSS";
pub const RCV_MSS: &str = "RcvMSS";
pub const SND_WIN_SCALE: &str = "SndWinScale";
pub const RCV_WIN_SCALE: &str = "RcvWinScale";
pub const TIMESTAMPS_ENABLED: &str = "TimestampsEnabled";
pub const SACK_ENABLED: &str = "SACKEnabled";
pub const WIN_SCALE_ENABLED: &str = "WinScaleEnabled";
pub const ECN_ENABLED: &str = "ECNEnabled";
pub const CURRENT_RTO: &str = "CurrentRTO";
pub const SAMPLE_RTT: &str = "SampleRTT";
pub const RTT_VAR: &str = "RTTVar";
pub const MIN_RTT: &str = "MinRTT";
pub const CUR_CWND: &str = "CurCwnd";
pub const CUR_SSTHRESH: &str = "CurSsthresh";
pub const CUR_RWIN_RCVD: &str = "CurRwinRcvd";
pub const BACKOFF: &str = "Backoff";
pub const PKTS_UNACKED: &str = "PktsUnacked";
pub const SACKED: &str = "Sacked";
pub const LOST: &str = "Lost";
pub const REORDERING: &str = "Reordering";
pub const PKTS_RETRANS: &str = "PktsRetrans";
pub const PKTS_OUT: &str = "PktsOut";
pub const PKTS_IN: &str = "PktsIn";
pub const DATA_PKTS_OUT: &str = "DataPktsOut";
pub const DATA_PKTS_IN: &str = "DataPktsIn";
pub const DATA_BYTES_OUT: &str = "DataBytesOut";
pub const DATA_BYTES_IN: &str = "DataBytesIn";
pub const BYTES_ACKED: &str = "BytesAcked";
pub const BYTES_RETRANS: &str = "BytesRetrans";
pub const DSACK_DUPS: &str = "DSACKDups";
pub const REORD_SEEN: &str = "ReordSeen";
pub const PACING_RATE: &str = "PacingRate";
pub const DELIVERY_RATE: &str = "DeliveryRate";
pub const NOTSENT_BYTES: &str = "NotsentBytes";
pub const BUSY_TIME: &str = "BusyTime";
pub const SND_LIM_TIME_RWIN: &str = "SndLimTimeRwin";
pub const SND_LIM_TIME_CWND: &str = "SndLimTimeCwnd";
pub const SND_LIM_TIME_SENDER: &str = "SndLimTimeSender";
pub const SNDBUF: &str = "Sndbuf";
pub const RCVBUF: &str = "Rcvbuf";
pub const SEND_QUEUE: &str = "SendQueue";
pub const RECV_QUEUE: &str = "RecvQueue";

// cumulative values derived by the aggregator
pub const SUM_RTT: &str = "SumRTT";
pub const COUNT_RTT: &str = "CountRTT";
pub const MAX_RTT: &str = "MaxRTT";
pub const MAX_RTO: &str = "MaxRTO";
pub const MAX_CWND: &str = "MaxCwnd";
pub const MAX_SSTHRESH: &str = "MaxSsthresh";
pub const MAX_RWIN_RCVD: &str = "MaxRwinRcvd";
pub const CONGESTION_SIGNALS: &str = "CongestionSignals";
pub const TIMEOUTS: &str = "Timeouts";
pub const DUP_ACKS_IN: &str = "DupAcksIn";
pub const ACK_PKTS_IN: &str = "AckPktsIn";
pub const SND_LIM_TRANS_RWIN: &str = "SndLimTransRwin";
pub const SND_LIM_TRANS_CWND: &str = "SndLimTransCwnd";
pub const SND_LIM_TRANS_SENDER: &str = "SndLimTransSender";
pub const CWND_INCREASES: &str = "CwndIncrease";
pub const CWND_DECREASES: &str = "CwndDecrease";
pub const CWND_UNCHANGED: &str = "CwndSame";
